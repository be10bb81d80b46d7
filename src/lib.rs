//! textwire: a line-oriented, length-prefixed text protocol
//!
//! Commands and responses share one memcached-style grammar:
//!
//! ```text
//! <TOKEN> (" " <TOKEN>)*\r\n
//! [<payload bytes of declared length>\r\n]
//! ```
//!
//! Modules:
//! - `protocol`: codec, incremental frame reader, request/response values
//! - `server`: command registry and the per-connection state machine
//! - `runtime`: thread-per-connection and tokio drivers for that state machine
//! - `pool`: bounded pool of reusable client sockets
//! - `client`: blocking request executor with reconnect-once recovery
//! - `instrument`: optional lifecycle event sink
//! - `config`: CLI and TOML configuration for the server binary

pub mod client;
pub mod config;
pub mod instrument;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientError};
pub use pool::{Pool, PoolConfig, PoolError, PoolRegistry};
pub use protocol::{DataExpectation, MultiRequest, ProtocolError, Request, Response};
pub use server::{CommandRegistry, HandlerError};
