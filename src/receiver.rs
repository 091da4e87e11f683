//! Per-channel receiver threads.
//!
//! Each channel gets one thread that reads its transport, decodes frames,
//! and queues every message for the host. When the stream ends, or a read
//! or decode fails, the thread tears the channel down and exits. It is
//! never restarted.
//!
//! # Teardown
//!
//! 1. unregister the channel
//! 2. shut the transport down
//! 3. for jobs: reap the process and report its exit (at most once)
//! 4. post the channel id on the exit queue if shutdown is waiting for it

use std::io;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::broker::Shared;
use crate::channel::{ChannelId, ChannelKind, Transport};
use crate::control::ControlCommand;
use crate::jobs::{reap_and_report, REAP_GRACE};
use crate::queue::QueueItem;
use crate::wire::{FrameDecoder, FrameError};

/// Why a receiver stopped.
#[derive(Debug)]
enum Closed {
    Eof,
    Read(io::Error),
    Frame(FrameError),
    /// The host dropped its inbox; nothing will ever be answered.
    QueueGone,
}

struct Receiver {
    shared: Arc<Shared>,
    channel: ChannelId,
    transport: Arc<dyn Transport>,
    decoder: FrameDecoder,
}

/// Start the receiver thread for a registered channel.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    channel: ChannelId,
    transport: Arc<dyn Transport>,
) -> io::Result<()> {
    let decoder = FrameDecoder::new(shared.config.max_frame_bytes);
    let receiver = Receiver {
        shared,
        channel,
        transport,
        decoder,
    };
    thread::Builder::new()
        .name(format!("rpc-channel-{}", channel))
        .spawn(move || receiver.run())?;
    Ok(())
}

impl Receiver {
    fn run(mut self) {
        debug!("Receiver for channel {} ({}) started", self.channel, self.transport.describe());
        let reason = self.pump();
        match &reason {
            Closed::Eof => info!("Channel {} closed by peer", self.channel),
            Closed::Read(e) => warn!("Channel {} read failed: {}", self.channel, e),
            Closed::Frame(e) => error!("Channel {} framing lost: {}", self.channel, e),
            Closed::QueueGone => warn!("Channel {}: host inbox dropped", self.channel),
        }
        self.teardown();
    }

    fn pump(&mut self) -> Closed {
        let chunk = self.shared.config.read_chunk;
        loop {
            let bytes = match self.transport.read(chunk) {
                Ok(bytes) if bytes.is_empty() => return Closed::Eof,
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Closed::Read(e),
            };

            let messages = match self.decoder.feed(&bytes) {
                Ok(messages) => messages,
                Err(e) => return Closed::Frame(e),
            };

            for message in messages {
                debug!("Channel {} received {}", self.channel, message.kind());
                let item = QueueItem {
                    transport: self.transport.clone(),
                    channel: self.channel,
                    message,
                };
                if self.shared.queue.send(item).is_err() {
                    return Closed::QueueGone;
                }
                self.shared.control.notify(ControlCommand::Wake);
            }
        }
    }

    fn teardown(self) {
        let Receiver {
            shared,
            channel,
            transport,
            ..
        } = self;

        shared.registry.unregister(channel);
        if let Err(e) = transport.shutdown() {
            debug!("Channel {} shutdown: {}", channel, e);
        }

        if transport.kind() == ChannelKind::Process {
            reap_and_report(&shared, channel, REAP_GRACE);
        }

        // Only a sealed registry has a shutdown waiting on exits. Sealing
        // happens before shutdown lists channels, so every listed channel
        // posts here.
        if shared.registry.is_sealed() {
            let _ = shared.exits.send(channel);
        }
        info!("=== channel {} closed ===", channel);
    }
}
