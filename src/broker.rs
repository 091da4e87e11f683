//! The broker instance: listeners, shared state and lifecycle.
//!
//! [`Broker::start`] binds the RPC and control listeners and hands back the
//! broker together with the [`Inbox`] the host drains through a
//! [`Dispatcher`](crate::dispatch::Dispatcher). Everything receiver threads
//! and the job manager touch lives in one [`Shared`] behind an `Arc`, so
//! several brokers can run side by side in one process.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelId, ChannelRegistry, SocketTransport, Transport};
use crate::config::BrokerConfig;
use crate::control::ControlChannel;
use crate::error::BrokerError;
use crate::jobs::{JobManager, ProcessTable};
use crate::listener::Listener;
use crate::queue::{queue, Inbox, QueueItem};
use crate::receiver;
use crate::shutdown::{self, ShutdownReport, ShutdownTicket};

/// State shared by the listeners, receiver threads and job manager.
pub(crate) struct Shared {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: ChannelRegistry,
    pub(crate) control: Arc<ControlChannel>,
    pub(crate) processes: ProcessTable,
    pub(crate) queue: Sender<QueueItem>,
    /// Receivers post their channel id here once shutdown has sealed the
    /// registry.
    pub(crate) exits: Sender<ChannelId>,
}

impl Shared {
    pub(crate) fn new(config: BrokerConfig) -> (Arc<Self>, Inbox, mpsc::Receiver<ChannelId>) {
        let (queue_tx, inbox) = queue();
        let (exits_tx, exits_rx) = mpsc::channel();
        let control = Arc::new(ControlChannel::new(&config));
        let shared = Arc::new(Self {
            config,
            registry: ChannelRegistry::new(),
            control,
            processes: ProcessTable::default(),
            queue: queue_tx,
            exits: exits_tx,
        });
        (shared, inbox, exits_rx)
    }
}

/// A running broker.
///
/// Dropping it without calling [`shutdown`](Broker::shutdown) runs both
/// shutdown phases, which can block for up to the configured timeout.
pub struct Broker {
    shared: Arc<Shared>,
    rpc_listener: Listener,
    control_listener: Listener,
    exits: mpsc::Receiver<ChannelId>,
    ticket: Option<ShutdownTicket>,
    report: Option<ShutdownReport>,
}

impl Broker {
    /// Bind both listeners and start accepting.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Bind`] if either address cannot be bound.
    pub fn start(config: BrokerConfig) -> Result<(Self, Inbox), BrokerError> {
        let (shared, inbox, exits) = Shared::new(config);

        let control_addr = shared.config.control_addr;
        let control_listener = {
            let control = shared.control.clone();
            Listener::spawn("control", control_addr, move |stream| control.serve(stream))
                .map_err(|source| BrokerError::Bind {
                    what: "control",
                    addr: control_addr,
                    source,
                })?
        };

        let listen_addr = shared.config.listen_addr;
        let rpc_listener = {
            let shared = shared.clone();
            Listener::spawn("rpc", listen_addr, move |stream| accept_socket(&shared, stream))
        };
        let rpc_listener = match rpc_listener {
            Ok(listener) => listener,
            Err(source) => {
                control_listener.stop();
                control_listener.join();
                return Err(BrokerError::Bind {
                    what: "rpc",
                    addr: listen_addr,
                    source,
                });
            }
        };

        info!(
            "Broker listening on {} (control {})",
            rpc_listener.local_addr(),
            control_listener.local_addr()
        );

        let broker = Self {
            shared,
            rpc_listener,
            control_listener,
            exits,
            ticket: None,
            report: None,
        };
        Ok((broker, inbox))
    }

    /// Address peers connect to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_listener.local_addr()
    }

    /// Address the host's control connection connects to.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_listener.local_addr()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    pub fn jobs(&self) -> JobManager {
        JobManager::new(self.shared.clone())
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    pub fn control(&self) -> &ControlChannel {
        &self.shared.control
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.registry.is_sealed()
    }

    /// Phase one of shutdown. Never blocks; see [`shutdown`](crate::shutdown).
    ///
    /// Calling it again returns the first ticket.
    pub fn shutdown_pre(&mut self) -> ShutdownTicket {
        if let Some(ticket) = &self.ticket {
            return ticket.clone();
        }
        let ticket = shutdown::pre(&self.shared, &self.rpc_listener);
        self.ticket = Some(ticket.clone());
        ticket
    }

    /// Phase two of shutdown. Blocks for at most the configured timeout
    /// plus the time to kill stragglers.
    pub fn shutdown_post(&mut self, ticket: ShutdownTicket) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let report = shutdown::post(
            &self.shared,
            &ticket,
            &self.exits,
            [&self.rpc_listener, &self.control_listener],
        );
        self.report = Some(report.clone());
        report
    }

    /// Both phases back to back. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let ticket = self.shutdown_pre();
        self.shutdown_post(ticket)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if self.report.is_none() {
            debug!("Broker dropped without shutdown, shutting down");
            self.shutdown();
        }
    }
}

/// Turn an accepted connection into a socket channel.
fn accept_socket(shared: &Arc<Shared>, stream: TcpStream) {
    let id = match shared.registry.try_allocate() {
        Ok(id) => id,
        Err(_) => {
            debug!("Refusing connection during shutdown");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    let transport: Arc<dyn Transport> = match SocketTransport::new(stream) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            warn!("Failed to set up connection for channel {}: {}", id, e);
            return;
        }
    };

    if let Err(e) = shared.registry.register(id, transport.clone()) {
        debug!("Channel {} not registered: {}", id, e);
        let _ = transport.shutdown();
        return;
    }
    info!("=== channel {} opened: {} ===", id, transport.describe());

    if let Err(e) = receiver::spawn(shared.clone(), id, transport.clone()) {
        error!("Failed to start receiver for channel {}: {}", id, e);
        shared.registry.unregister(id);
        let _ = transport.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobCommand;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn quick_config() -> BrokerConfig {
        BrokerConfig {
            shutdown_timeout_ms: 500,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_start_binds_ephemeral_ports() {
        let (mut broker, _inbox) = Broker::start(quick_config()).unwrap();
        assert_ne!(broker.rpc_addr().port(), 0);
        assert_ne!(broker.control_addr().port(), 0);
        assert_ne!(broker.rpc_addr(), broker.control_addr());
        assert!(!broker.is_shutting_down());
        broker.shutdown();
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let (first, _inbox) = Broker::start(quick_config()).unwrap();
        let config = BrokerConfig {
            listen_addr: first.rpc_addr(),
            ..quick_config()
        };
        match Broker::start(config) {
            Err(BrokerError::Bind { what, .. }) => assert_eq!(what, "rpc"),
            Err(e) => panic!("Expected bind error, got {}", e),
            Ok(_) => panic!("Expected bind error"),
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (mut broker, _inbox) = Broker::start(quick_config()).unwrap();
        let first = broker.shutdown();
        assert_eq!(first, ShutdownReport::default());
        assert_eq!(broker.shutdown(), first);
        assert!(broker.is_shutting_down());
    }

    #[test]
    fn test_spawn_refused_after_pre() {
        let (mut broker, _inbox) = Broker::start(quick_config()).unwrap();
        let ticket = broker.shutdown_pre();
        assert!(ticket.channels().is_empty());

        let err = broker.jobs().spawn(&JobCommand::new("true")).unwrap_err();
        assert!(matches!(err, BrokerError::ShuttingDown));

        let started = std::time::Instant::now();
        broker.shutdown_post(ticket);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_two_brokers_coexist() {
        let (a, _inbox_a) = Broker::start(quick_config()).unwrap();
        let (b, _inbox_b) = Broker::start(quick_config()).unwrap();
        assert_ne!(a.rpc_addr(), b.rpc_addr());
        assert_eq!(a.registry().allocate(), ChannelId(1));
        assert_eq!(b.registry().allocate(), ChannelId(1));
    }
}
