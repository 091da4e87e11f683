//! Channels: identities, kinds, lifecycle states and their transports.

mod registry;
mod transport;

pub use registry::ChannelRegistry;
pub use transport::{ProcessTransport, SocketTransport, Transport};

use serde::{Deserialize, Serialize};

/// Process-unique channel identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ChannelId> for rmpv::Value {
    fn from(id: ChannelId) -> Self {
        rmpv::Value::from(id.0)
    }
}

/// What a channel is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// An accepted TCP client.
    Socket,
    /// A spawned job's stdin/stdout.
    Process,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Socket => "socket",
            ChannelKind::Process => "process",
        }
    }
}

/// Channel lifecycle: `Open → Closing → Closed`. A transport error jumps
/// straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// Shutdown has signaled the peer; waiting for the receiver to finish.
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed)
    }
}
