//! Reliable, ordered, congestion-controlled message streams over UDP.
//!
//! The crate is socket-agnostic: the host reads datagrams however it
//! likes and feeds them to a [`WorkerPool`], which shards sessions across
//! worker tasks by peer address. Outbound datagrams leave through an
//! [`OutputSink`] and reassembled messages arrive via [`SessionEvents`].

pub mod config;
pub mod conn;
pub mod dispatch;
pub mod segment;
pub mod shard;
pub mod sink;
pub mod telemetry;

pub use config::{ConfigError, EndpointConfig, FileConfig, PoolConfig, ProtocolConfig};
pub use conn::{ConnState, ConnStats, Connection, InputError, SendError};
pub use dispatch::{rand_conv, shard_for, RouteError, WorkerPool};
pub use segment::{Cmd, DecodeError, Segment};
pub use sink::{OutputSink, SessionEvents};
