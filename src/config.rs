//! Broker configuration.
//!
//! Defaults match what the editor-side plugin expects, so a host that does
//! nothing gets a working broker on ephemeral loopback ports. Values can be
//! loaded from a JSON file and then overridden from the environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;

/// Env var overriding the RPC listen address.
pub const ADDR_ENV: &str = "NVIM_RPC_ADDR";
/// Env var overriding the control listen address.
pub const CONTROL_ADDR_ENV: &str = "NVIM_RPC_CONTROL_ADDR";
/// Env var overriding the shutdown wait, in milliseconds.
pub const SHUTDOWN_TIMEOUT_ENV: &str = "NVIM_RPC_SHUTDOWN_TIMEOUT_MS";
/// Env var overriding the host idle tick, in milliseconds.
pub const IDLE_TICK_ENV: &str = "NVIM_RPC_IDLE_TICK_MS";

/// Placeholder replaced by the channel id in [`BrokerConfig::exit_command`].
pub const CHANNEL_PLACEHOLDER: &str = "{channel}";
/// Placeholder replaced by the exit status in [`BrokerConfig::exit_command`].
pub const STATUS_PLACEHOLDER: &str = "{status}";

/// Runtime configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address peers connect to for msgpack-rpc.
    pub listen_addr: SocketAddr,
    /// Address the host connects to for wake-ups.
    pub control_addr: SocketAddr,
    /// How long shutdown waits for channels to exit on their own.
    pub shutdown_timeout_ms: u64,
    /// How often the host drains even without a wake-up. This bounds the
    /// latency of a lost wake.
    pub idle_tick_ms: u64,
    /// Maximum bytes requested per transport read.
    pub read_chunk: usize,
    /// Largest partial frame a channel may buffer before it is dropped.
    pub max_frame_bytes: usize,
    /// Second element of the host's setup message.
    pub setup_token: String,
    /// Command sent to the host when it completes setup.
    pub setup_reply: String,
    /// Command sent to the host when work is queued.
    pub wake_command: String,
    /// Command sent to the host when a job channel exits.
    pub exit_command: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shutdown_timeout_ms: 3000,
            idle_tick_ms: 100,
            read_chunk: 4096,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            setup_token: "neovim_rpc_setup".to_string(),
            setup_reply: "call neovim_rpc#_callback()".to_string(),
            wake_command: "call neovim_rpc#_callback()".to_string(),
            exit_command: "call neovim_rpc#_on_exit({channel}, {status})".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Default config file location (`<config dir>/nvim-rpc-broker/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nvim-rpc-broker").join("config.json"))
    }

    /// Load a config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, BrokerError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Using config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), BrokerError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), BrokerError> {
        if let Some(value) = lookup(ADDR_ENV) {
            self.listen_addr = parse_env(ADDR_ENV, &value)?;
        }
        if let Some(value) = lookup(CONTROL_ADDR_ENV) {
            self.control_addr = parse_env(CONTROL_ADDR_ENV, &value)?;
        }
        if let Some(value) = lookup(SHUTDOWN_TIMEOUT_ENV) {
            self.shutdown_timeout_ms = parse_env(SHUTDOWN_TIMEOUT_ENV, &value)?;
        }
        if let Some(value) = lookup(IDLE_TICK_ENV) {
            self.idle_tick_ms = parse_env(IDLE_TICK_ENV, &value)?;
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    /// Render the exit command for a channel. A missing status (killed by a
    /// signal, or never observed) renders as `-1`.
    pub fn render_exit_command(&self, channel: u64, status: Option<i32>) -> String {
        self.exit_command
            .replace(CHANNEL_PLACEHOLDER, &channel.to_string())
            .replace(STATUS_PLACEHOLDER, &status.unwrap_or(-1).to_string())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BrokerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BrokerError::Config(format!("Invalid {} value `{}`: {}", key, value, e)))
}
