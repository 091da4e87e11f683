//! The shared delivery queue between receiver threads and the host.
//!
//! Every receiver holds a clone of the sending half; the host owns the
//! single [`Inbox`]. The queue is unbounded and strictly FIFO across all
//! producers.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;

use crate::channel::{ChannelId, Transport};
use crate::wire::Message;

/// One decoded message plus where to send the reply.
pub struct QueueItem {
    pub transport: Arc<dyn Transport>,
    pub channel: ChannelId,
    pub message: Message,
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueItem")
            .field("transport", &self.transport.describe())
            .field("channel", &self.channel)
            .field("message", &self.message)
            .finish()
    }
}

/// Receiving end of the queue. Not `Sync`: only the host thread drains it.
pub struct Inbox {
    rx: Receiver<QueueItem>,
}

impl Inbox {
    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<QueueItem> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub(crate) fn queue() -> (Sender<QueueItem>, Inbox) {
    let (tx, rx) = mpsc::channel();
    (tx, Inbox { rx })
}
