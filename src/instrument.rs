//! Lifecycle event sink.
//!
//! Servers and pools report events to an optional [`Instrumentation`]
//! implementation. Every method has an empty default, so a sink only
//! overrides what it cares about, and a missing sink costs nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Receiver for connection, command and pool events.
pub trait Instrumentation: Send + Sync {
    fn connection_opened(&self, _peer: Option<SocketAddr>) {}

    fn connection_closed(&self, _peer: Option<SocketAddr>) {}

    fn command_received(&self, _command: &str) {}

    fn command_dispatched(&self, _command: &str) {}

    fn command_completed(&self, _command: &str, _elapsed: Duration) {}

    fn socket_created(&self, _endpoint: &str) {}

    fn socket_closed(&self, _endpoint: &str) {}
}

/// Shared, optional sink.
pub type Sink = Option<Arc<dyn Instrumentation>>;

/// Invoke `f` on the sink if one is installed.
pub(crate) fn emit<F>(sink: &Sink, f: F)
where
    F: FnOnce(&dyn Instrumentation),
{
    if let Some(sink) = sink {
        f(sink.as_ref());
    }
}
