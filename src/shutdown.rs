//! Two-phase shutdown.
//!
//! **pre** runs on the host thread and never blocks: it stops accepting,
//! seals the registry so no new channel can appear, marks every channel
//! closing, and asks each peer to go away (SIGTERM plus closed stdin for
//! jobs, a socket shutdown for clients).
//!
//! **post** waits, up to one shared deadline, for the signaled channels'
//! receivers to report that they finished. Whatever is still around at
//! the deadline is killed or force-closed. Then the control channel and
//! the listener threads are shut down.

use std::collections::BTreeSet;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::broker::Shared;
use crate::channel::{ChannelId, ChannelKind};
use crate::jobs::reap_and_report;
use crate::listener::Listener;

/// Channels signaled by phase *pre*, handed to phase *post*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownTicket {
    channels: Vec<ChannelId>,
    signaled_at: Instant,
}

impl ShutdownTicket {
    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    /// Time since phase *pre* ran.
    pub fn elapsed(&self) -> Duration {
        self.signaled_at.elapsed()
    }
}

/// How each signaled channel ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Channels whose receiver finished before the deadline.
    pub exited: Vec<ChannelId>,
    /// Channels that had to be killed or force-closed.
    pub forced: Vec<ChannelId>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }
}

pub(crate) fn pre(shared: &Shared, rpc_listener: &Listener) -> ShutdownTicket {
    info!("Shutdown: stopping RPC listener on {}", rpc_listener.local_addr());
    rpc_listener.stop();
    shared.registry.seal();

    let channels = shared.registry.list();
    for &id in &channels {
        shared.registry.mark_closing(id);

        if shared.registry.kind(id) == Some(ChannelKind::Process) {
            shared.processes.terminate(id);
        }
        // Closes a job's stdin, or shuts a client socket down.
        if let Some(transport) = shared.registry.get(id) {
            if let Err(e) = transport.shutdown() {
                warn!("Shutdown of channel {} failed: {}", id, e);
            }
        }
    }

    info!("Shutdown: signaled {} channel(s)", channels.len());
    ShutdownTicket {
        channels,
        signaled_at: Instant::now(),
    }
}

pub(crate) fn post(
    shared: &Shared,
    ticket: &ShutdownTicket,
    exits: &Receiver<ChannelId>,
    listeners: [&Listener; 2],
) -> ShutdownReport {
    let deadline = Instant::now() + shared.config.shutdown_timeout();
    let mut pending: BTreeSet<ChannelId> = ticket.channels.iter().copied().collect();
    let mut exited = Vec::new();

    while !pending.is_empty() {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break;
        };
        match exits.recv_timeout(remaining) {
            Ok(id) => {
                if pending.remove(&id) {
                    debug!("Shutdown: channel {} exited", id);
                    exited.push(id);
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let forced: Vec<ChannelId> = pending.into_iter().collect();
    for &id in &forced {
        force_close(shared, id);
    }

    shared.control.close();
    for listener in listeners {
        listener.stop();
        listener.join();
    }

    exited.sort_unstable();
    info!(
        "Shutdown complete: {} exited, {} forced",
        exited.len(),
        forced.len()
    );
    ShutdownReport { exited, forced }
}

fn force_close(shared: &Shared, id: ChannelId) {
    warn!("Channel {} did not exit in time, forcing", id);
    if let Some(transport) = shared.registry.unregister(id) {
        let _ = transport.shutdown();
    }
    // Checks for an exit that raced the deadline before killing.
    reap_and_report(shared, id, Duration::ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Shared;
    use crate::channel::{ChannelState, SocketTransport, Transport};
    use crate::config::BrokerConfig;
    use crate::receiver;
    use pretty_assertions::assert_eq;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    fn config(timeout_ms: u64) -> BrokerConfig {
        BrokerConfig {
            shutdown_timeout_ms: timeout_ms,
            ..BrokerConfig::default()
        }
    }

    fn rpc_listener() -> Listener {
        let addr = "127.0.0.1:0".parse().unwrap();
        Listener::spawn("rpc", addr, |_| {}).unwrap()
    }

    fn socket_channel(shared: &Arc<Shared>, spawn_receiver: bool) -> (ChannelId, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let transport: Arc<dyn Transport> = Arc::new(SocketTransport::new(server).unwrap());
        let id = shared.registry.allocate();
        shared.registry.register(id, transport.clone()).unwrap();
        if spawn_receiver {
            receiver::spawn(shared.clone(), id, transport).unwrap();
        }
        (id, client)
    }

    #[test]
    fn test_pre_seals_and_marks_closing() {
        let (shared, _inbox, _exits) = Shared::new(config(100));
        let rpc = rpc_listener();
        let (id, _client) = socket_channel(&shared, false);

        let ticket = pre(&shared, &rpc);

        assert_eq!(ticket.channels(), &[id]);
        assert!(!rpc.is_accepting());
        assert!(shared.registry.is_sealed());
        assert_eq!(shared.registry.state(id), Some(ChannelState::Closing));
        assert!(shared.registry.try_allocate().is_err());
    }

    #[test]
    fn test_post_collects_receiver_exits() {
        let (shared, _inbox, exits) = Shared::new(config(5_000));
        let rpc = rpc_listener();
        let control = rpc_listener();
        let (a, _client_a) = socket_channel(&shared, true);
        let (b, _client_b) = socket_channel(&shared, true);

        let ticket = pre(&shared, &rpc);
        let report = post(&shared, &ticket, &exits, [&rpc, &control]);

        assert_eq!(report.exited, vec![a, b]);
        assert!(report.is_clean());
        assert!(shared.registry.is_empty());
    }

    #[test]
    fn test_post_forces_silent_channels_at_deadline() {
        let (shared, _inbox, exits) = Shared::new(config(100));
        let rpc = rpc_listener();
        let control = rpc_listener();
        // No receiver: nothing will ever report this channel.
        let (id, _client) = socket_channel(&shared, false);

        let ticket = pre(&shared, &rpc);
        let started = Instant::now();
        let report = post(&shared, &ticket, &exits, [&rpc, &control]);

        assert_eq!(report.forced, vec![id]);
        assert!(report.exited.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(shared.registry.state(id), Some(ChannelState::Closed));
    }
}
