//! Out-of-band control channel back to the host.
//!
//! The host cannot poll sockets itself, so the broker keeps one JSON
//! connection to it (the editor's own channel protocol) and uses it only
//! to ask the host to run a command: either "drain pending work" or
//! "channel N exited".
//!
//! # Protocol
//!
//! ```text
//! host   → broker   [seq, "neovim_rpc_setup"]        first message, seq >= 0
//! broker → host     ["ex", "<setup reply>"]
//! broker → host     ["ex", "<wake command>"]         whenever work is queued
//! broker → host     ["ex", "<exit command for N>"]   when job channel N exits
//! ```
//!
//! Delivery is best effort. If no host is connected, or the write fails,
//! the command is dropped and the host's idle-tick drain is the fallback.
//! [`ControlChannel::try_notify`] reports whether a frame went out so
//! callers and tests can see missed wakes.

use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelId;
use crate::config::BrokerConfig;

/// Commands the broker can ask the host to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Queue has work; call `drain()`.
    Wake,
    /// A job channel's process is gone.
    ChannelExited {
        channel: ChannelId,
        status: Option<i32>,
    },
}

/// Counters for delivered and dropped control frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyStats {
    pub delivered: u64,
    pub missed: u64,
}

struct Installed {
    generation: u64,
    stream: TcpStream,
}

/// The single, replaceable host connection.
pub struct ControlChannel {
    config: BrokerConfig,
    /// The connection `notify` writes to. Replacing it drops the old one
    /// without telling it.
    slot: Mutex<Option<Installed>>,
    /// Every open control connection, so `close` can unblock their readers.
    connections: Mutex<HashMap<u64, TcpStream>>,
    next_generation: AtomicU64,
    delivered: AtomicU64,
    missed: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Encode a control frame: `["ex", command]`.
pub fn encode_command(command: &str) -> Vec<u8> {
    json!(["ex", command]).to_string().into_bytes()
}

/// Whether `value` is the host's setup message `[seq >= 0, token]`.
pub fn is_setup_message(value: &serde_json::Value, token: &str) -> bool {
    let Some(items) = value.as_array() else {
        return false;
    };
    let seq_ok = items
        .first()
        .and_then(serde_json::Value::as_f64)
        .is_some_and(|seq| seq >= 0.0);
    seq_ok && items.get(1).and_then(serde_json::Value::as_str) == Some(token)
}

impl ControlChannel {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            config: config.clone(),
            slot: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
            missed: AtomicU64::new(0),
        }
    }

    /// Text of the command the host will run.
    pub fn render(&self, command: ControlCommand) -> String {
        match command {
            ControlCommand::Wake => self.config.wake_command.clone(),
            ControlCommand::ChannelExited { channel, status } => {
                self.config.render_exit_command(channel.0, status)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
        }
    }

    /// Send `command` to the host. Returns whether a frame was written.
    ///
    /// A write failure clears the slot; the host has to set up again.
    pub fn try_notify(&self, command: ControlCommand) -> bool {
        let text = self.render(command);
        let mut slot = lock(&self.slot);
        let Some(installed) = slot.as_mut() else {
            debug!("No control connection, dropping `{}`", text);
            self.missed.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        debug!("Sending control command `{}`", text);
        let frame = encode_command(&text);
        match installed
            .stream
            .write_all(&frame)
            .and_then(|_| installed.stream.flush())
        {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("Control channel write failed, dropping connection: {}", e);
                *slot = None;
                self.missed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Fire-and-forget form of [`try_notify`](Self::try_notify).
    pub fn notify(&self, command: ControlCommand) {
        let _ = self.try_notify(command);
    }

    /// Serve a freshly accepted host connection on its own thread.
    pub(crate) fn serve(self: &Arc<Self>, stream: TcpStream) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        match stream.try_clone() {
            Ok(clone) => {
                lock(&self.connections).insert(generation, clone);
            }
            Err(e) => {
                error!("Failed to clone control connection: {}", e);
                return;
            }
        }

        let channel = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("rpc-control-{}", generation))
            .spawn(move || {
                channel.handle_connection(generation, stream);
                lock(&channel.connections).remove(&generation);
            });
        if let Err(e) = spawned {
            error!("Failed to spawn control connection thread: {}", e);
            lock(&self.connections).remove(&generation);
        }
    }

    fn handle_connection(&self, generation: u64, stream: TcpStream) {
        info!("=== control connection {} opened ===", generation);
        let reader = match stream.try_clone() {
            Ok(reader) => BufReader::new(reader),
            Err(e) => {
                error!("Failed to clone control connection: {}", e);
                return;
            }
        };

        let mut installed = false;
        let values = serde_json::Deserializer::from_reader(reader).into_iter::<serde_json::Value>();
        for value in values {
            let value = match value {
                Ok(value) => value,
                Err(e) if e.is_eof() => break,
                Err(e) => {
                    warn!("Control connection {}: bad JSON: {}", generation, e);
                    break;
                }
            };
            debug!("Control connection {} received: {}", generation, value);

            if is_setup_message(&value, &self.config.setup_token) {
                match stream.try_clone() {
                    Ok(writer) => installed = self.install(generation, writer) || installed,
                    Err(e) => error!("Failed to clone control connection: {}", e),
                }
            } else if !installed {
                error!(
                    "Control connection {} did not start with setup, closing: {}",
                    generation, value
                );
                break;
            } else {
                error!("Unrecognized control request: {}", value);
            }
        }

        self.release(generation);
        let _ = stream.shutdown(Shutdown::Both);
        info!("=== control connection {} closed ===", generation);
    }

    fn install(&self, generation: u64, mut stream: TcpStream) -> bool {
        let mut slot = lock(&self.slot);
        let frame = encode_command(&self.config.setup_reply);
        if let Err(e) = stream.write_all(&frame).and_then(|_| stream.flush()) {
            warn!("Failed to acknowledge control setup: {}", e);
            return false;
        }
        if slot.is_some() {
            debug!("Replacing control connection with {}", generation);
        }
        info!("Control connection {} installed", generation);
        *slot = Some(Installed { generation, stream });
        true
    }

    /// Clear the slot if it still holds `generation`.
    fn release(&self, generation: u64) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            *slot = None;
        }
    }

    /// Drop the installed connection and shut down every control socket.
    pub fn close(&self) {
        lock(&self.slot).take();
        for (_, stream) in lock(&self.connections).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
