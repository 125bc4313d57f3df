//! # Respool
//!
//! A client-side transport for Redis-compatible servers written in Rust.
//!
//! Respool speaks RESP2 over TCP. A `Connection` carries one request at a
//! time and reconnects on its own after link failures; a `Pipeline` batches
//! commands into a single write and can unwrap MULTI/EXEC blocks; a `Pool`
//! spreads calls over a fixed set of connections.

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod framer;
pub mod pipeline;
pub mod pool;
pub mod resp;
pub mod signal;

pub use command::Command;
pub use config::ClientConfig;
pub use connection::{Connection, ConnectionEvent, Phase};
pub use error::{ClientError, ClientResult};
pub use pipeline::Pipeline;
pub use pool::Pool;
pub use resp::RespValue;
