//! Broker-level error types.
//!
//! These are the failures an embedding host sees from setup calls
//! (starting the broker, spawning jobs, loading config). Per-message
//! failures never surface here: they become response errors or log lines.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by broker setup and lifecycle operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A listener could not be bound.
    #[error("Failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A job process could not be started.
    #[error("Failed to spawn job `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The broker has entered shutdown and refuses new channels.
    #[error("Broker is shutting down")]
    ShuttingDown,

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other I/O failure (thread spawn, stream clone).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a method handler.
///
/// Its text is what the peer sees in the response error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        // Alternate formatting keeps the context chain on one line.
        HandlerError::new(format!("{:#}", err))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}
