//! Host-thread dispatcher.
//!
//! The dispatcher is the only place handlers run. The host calls
//! [`Dispatcher::drain`] from its own thread (on every wake-up and on its
//! idle tick); each call empties the queue without blocking and writes one
//! response per request back to the transport the request came from.

mod api_info;
mod codec;
mod table;

pub use api_info::{build_api_info, is_api_info_method, map_get, API_INFO_METHODS, API_LEVEL};
pub use codec::{walk_value, ValueCodec, WireValues};
pub use table::{CallContext, FnTable, HandlerFn, MethodTable};

use std::panic::{catch_unwind, AssertUnwindSafe};

use rmpv::Value;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelId, Transport};
use crate::queue::{Inbox, QueueItem};
use crate::wire::{encode_message, Message, RpcError};

/// Drains the shared queue and runs handlers on the calling thread.
///
/// `drain` takes `&mut self`, so it cannot be re-entered from inside a
/// handler.
pub struct Dispatcher<T, C = WireValues>
where
    T: MethodTable,
    C: ValueCodec<Native = T::Value>,
{
    inbox: Inbox,
    table: T,
    codec: C,
    api_info: Value,
}

impl<T> Dispatcher<T, WireValues>
where
    T: MethodTable<Value = Value>,
{
    /// Dispatcher for a table that works on wire values directly.
    pub fn with_wire_values(inbox: Inbox, table: T) -> Self {
        Self::new(inbox, table, WireValues)
    }
}

impl<T, C> Dispatcher<T, C>
where
    T: MethodTable,
    C: ValueCodec<Native = T::Value>,
{
    pub fn new(inbox: Inbox, table: T, codec: C) -> Self {
        let api_info = build_api_info(&table.method_names());
        Self {
            inbox,
            table,
            codec,
            api_info,
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut T {
        &mut self.table
    }

    /// Process every queued message, oldest first. Never blocks.
    ///
    /// Returns the number of messages handled.
    pub fn drain(&mut self) -> usize {
        debug!("Draining queue");
        let mut processed = 0;
        while let Some(item) = self.inbox.try_pop() {
            self.dispatch(item);
            processed += 1;
        }
        processed
    }

    fn dispatch(&mut self, item: QueueItem) {
        let QueueItem {
            transport,
            channel,
            message,
        } = item;
        debug!("Got {} from channel [{}]: {:?}", message.kind(), channel, message);

        match message {
            Message::Request { id, method, args } => {
                let outcome = self.call(channel, &method, args);
                if let Err(err) = &outcome {
                    error!("Request {} `{}` on channel {} failed: {}", id, method, channel, err.message);
                }
                respond(transport.as_ref(), channel, id, outcome);
            }
            Message::InvalidRequest { id, reason, .. } => {
                warn!("Invalid request {} on channel {}: {}", id, channel, reason);
                respond(transport.as_ref(), channel, id, Err(RpcError::generic(reason)));
            }
            Message::Notification { method, args } => match self.call(channel, &method, args) {
                Ok(result) => debug!("Notification `{}` result: {}", method, result),
                Err(err) => error!(
                    "Notification `{}` on channel {} failed: {}",
                    method, channel, err.message
                ),
            },
            Message::Response { id, .. } => {
                info!("Ignoring response {} from channel {}", id, channel);
            }
        }
    }

    fn call(&mut self, channel: ChannelId, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if is_api_info_method(method) {
            return Ok(Value::Array(vec![Value::from(channel), self.api_info.clone()]));
        }

        let args: Vec<T::Value> = args.into_iter().map(|arg| self.codec.from_wire(arg)).collect();

        let Some(handler) = self.table.lookup(method) else {
            return Err(RpcError::not_implemented(method));
        };

        let ctx = CallContext { channel };
        let table = &mut self.table;
        let result = catch_unwind(AssertUnwindSafe(|| table.invoke(handler, &ctx, args)));

        match result {
            Ok(Ok(value)) => Ok(self.codec.to_wire(value)),
            Ok(Err(err)) => Err(RpcError::generic(err.message())),
            Err(panic_info) => Err(RpcError::generic(panic_message(panic_info.as_ref()))),
        }
    }
}

/// Write the one response a request gets. A dead peer only costs a warning.
fn respond(transport: &dyn Transport, channel: ChannelId, id: u64, outcome: Result<Value, RpcError>) {
    match encode_message(Message::response(id, outcome)) {
        Ok(frame) => {
            debug!("Sending response {} to channel {}", id, channel);
            if let Err(e) = transport.write(&frame) {
                warn!("Failed to send response {} to channel {}: {}", id, channel, e);
            }
        }
        Err(e) => error!("Failed to encode response {}: {}", id, e),
    }
}

fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
