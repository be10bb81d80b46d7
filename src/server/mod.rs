//! Server-side command handling.
//!
//! - `registry`: command name to handler mapping, handler contracts
//! - `lifecycle`: the per-connection state machine driven by a runtime

pub mod lifecycle;
pub mod registry;

pub use lifecycle::{Action, Connection, LifecycleState};
pub use registry::{
    CommandRegistry, HandlerError, HandlerResult, Reply, ResponseStream,
    DEFAULT_DISCONNECT_COMMAND,
};
