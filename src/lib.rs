//! Channel-multiplexing msgpack-rpc broker for single-threaded hosts.
//!
//! An editor that embeds this crate can only run its API on its own thread,
//! but wants to talk to many peers at once: TCP clients and spawned jobs.
//! The broker reads every channel on its own thread, queues decoded
//! messages, and pokes the host over a small JSON control connection. The
//! host then calls [`Dispatcher::drain`] on its own thread, which runs the
//! handlers and writes the replies.
//!
//! - `channel` - channel ids, registry, socket and pipe transports
//! - `wire` - MessagePack envelopes and the incremental frame decoder
//! - `control` - the JSON wake-up connection back to the host
//! - `dispatch` - host-thread dispatcher, method tables and value codecs
//! - `jobs` - child-process channels
//! - `shutdown` - two-phase teardown
//!
//! # Usage
//!
//! ```ignore
//! use nvim_rpc_broker::{Broker, BrokerConfig, Dispatcher, FnTable, Value};
//!
//! let (mut broker, inbox) = Broker::start(BrokerConfig::default())?;
//! let table = FnTable::new().with("echo", |_ctx, args: Vec<Value>| {
//!     Ok(args.into_iter().next().unwrap_or(Value::Nil))
//! });
//! let mut dispatcher = Dispatcher::with_wire_values(inbox, table);
//!
//! // On every control-channel wake-up and every idle tick:
//! dispatcher.drain();
//!
//! // On exit:
//! let ticket = broker.shutdown_pre();
//! let report = broker.shutdown_post(ticket);
//! ```

pub mod broker;
pub mod channel;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod listener;
pub mod queue;
mod receiver;
pub mod shutdown;
pub mod wire;

pub use broker::Broker;
pub use channel::{ChannelId, ChannelKind, ChannelRegistry, ChannelState, Transport};
pub use config::BrokerConfig;
pub use control::{ControlChannel, ControlCommand, NotifyStats};
pub use dispatch::{CallContext, Dispatcher, FnTable, MethodTable, ValueCodec, WireValues};
pub use error::{BrokerError, HandlerError};
pub use jobs::{JobCommand, JobManager};
pub use queue::{Inbox, QueueItem};
pub use shutdown::{ShutdownReport, ShutdownTicket};
pub use wire::{Message, RpcError, Value};
