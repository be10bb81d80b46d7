//! Command registry and handler contracts.
//!
//! A handler answers a [`Request`] with either one [`Response`] or a lazy
//! stream of them. Handler faults are [`HandlerError`] values; any
//! `std::error::Error` converts into one with `?`, keeping the error's type
//! name as its kind. A panic inside a handler is caught and answered as a
//! `Panic` fault.

use crate::instrument::{Instrumentation, Sink};
use crate::protocol::{DataExpectation, ProtocolError, Request, Response, DEFAULT_MAX_PAYLOAD};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Disconnect command used when none is configured.
pub const DEFAULT_DISCONNECT_COMMAND: &str = "BYE";

/// A fault raised by a handler.
///
/// Does not implement `std::error::Error`; the blanket `From` impl below
/// depends on that.
pub struct HandlerError {
    kind: String,
    message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Short type name of the underlying fault.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn from_panic(cause: Box<dyn Any + Send>) -> Self {
        let message = match cause.downcast::<String>() {
            Ok(message) => *message,
            Err(cause) => match cause.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "handler panicked".to_string(),
            },
        };
        Self::new("Panic", message)
    }
}

/// Run handler code, turning a panic into a `Panic` fault.
pub(crate) fn catch_fault<T>(call: impl FnOnce() -> HandlerResult<T>) -> HandlerResult<T> {
    panic::catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|cause| Err(HandlerError::from_panic(cause)))
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        let full = std::any::type_name::<E>();
        let kind = full.rsplit("::").next().unwrap_or(full);
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Lazy, finite sequence of responses produced by a streaming handler.
///
/// The connection pulls the next item only after the previous one has been
/// written out.
pub type ResponseStream = Box<dyn Iterator<Item = HandlerResult<Response>> + Send>;

/// What a handler produced for one request.
pub enum Reply {
    Single(Response),
    Stream(ResponseStream),
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Single(response) => f.debug_tuple("Single").field(response).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

type SingleFn = dyn Fn(Request) -> HandlerResult<Response> + Send + Sync;
type StreamFn = dyn Fn(Request) -> HandlerResult<ResponseStream> + Send + Sync;
type ErrorFn = dyn Fn(&str, &HandlerError) -> HandlerResult<Response> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Single(Arc<SingleFn>),
    Stream(Arc<StreamFn>),
}

#[derive(Clone)]
struct Registration {
    expectation: DataExpectation,
    handler: Handler,
}

/// Maps command names to handlers. Built once before serving and shared
/// read-only by every connection.
pub struct CommandRegistry {
    commands: HashMap<String, Registration>,
    default: Registration,
    error_handler: Option<Arc<ErrorFn>>,
    disconnect_command: String,
    disconnect_handler: Arc<SingleFn>,
    instrumentation: Sink,
    max_payload: usize,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            default: Registration {
                expectation: DataExpectation::Auto,
                handler: Handler::Single(Arc::new(|request: Request| -> HandlerResult<Response> {
                    Ok(Response::error(
                        "UnknownCommand",
                        format!("unknown command {}", request.command()),
                    ))
                })),
            },
            error_handler: None,
            disconnect_command: DEFAULT_DISCONNECT_COMMAND.to_string(),
            disconnect_handler: Arc::new(|_: Request| -> HandlerResult<Response> {
                Ok(Response::status_only(DEFAULT_DISCONNECT_COMMAND))
            }),
            instrumentation: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Register a single-response handler.
    pub fn command<F>(mut self, name: &str, expectation: DataExpectation, handler: F) -> Self
    where
        F: Fn(Request) -> HandlerResult<Response> + Send + Sync + 'static,
    {
        self.commands.insert(
            name.to_ascii_uppercase(),
            Registration {
                expectation,
                handler: Handler::Single(Arc::new(handler)),
            },
        );
        self
    }

    /// Register a multi-response handler.
    pub fn streaming<F>(mut self, name: &str, expectation: DataExpectation, handler: F) -> Self
    where
        F: Fn(Request) -> HandlerResult<ResponseStream> + Send + Sync + 'static,
    {
        self.commands.insert(
            name.to_ascii_uppercase(),
            Registration {
                expectation,
                handler: Handler::Stream(Arc::new(handler)),
            },
        );
        self
    }

    /// Handler for commands with no registration. Uses `Auto` expectation.
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request) -> HandlerResult<Response> + Send + Sync + 'static,
    {
        self.default = Registration {
            expectation: DataExpectation::Auto,
            handler: Handler::Single(Arc::new(handler)),
        };
        self
    }

    /// Turns handler faults into responses. Its own failure falls back to
    /// the standard `ERROR` response.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &HandlerError) -> HandlerResult<Response> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn disconnect_command(mut self, name: &str) -> Self {
        self.disconnect_command = name.to_string();
        self
    }

    pub fn disconnect_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request) -> HandlerResult<Response> + Send + Sync + 'static,
    {
        self.disconnect_handler = Arc::new(handler);
        self
    }

    pub fn instrumentation(mut self, sink: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = Some(sink);
        self
    }

    /// Largest payload a request may declare. Larger ones close the connection.
    pub fn max_payload(mut self, limit: usize) -> Self {
        self.max_payload = limit;
        self
    }

    pub fn payload_limit(&self) -> usize {
        self.max_payload
    }

    pub(crate) fn sink(&self) -> &Sink {
        &self.instrumentation
    }

    /// Whether `name` is the disconnect command, ignoring case.
    pub fn is_disconnect(&self, name: &str) -> bool {
        name.eq_ignore_ascii_case(&self.disconnect_command)
    }

    /// Payload policy for a command line starting with `name`.
    pub fn expectation_for(&self, name: &str) -> DataExpectation {
        if self.is_disconnect(name) {
            return DataExpectation::Never;
        }
        self.lookup(name).expectation
    }

    fn lookup(&self, name: &str) -> &Registration {
        self.commands
            .get(&name.to_ascii_uppercase())
            .unwrap_or(&self.default)
    }

    /// Run the handler for `request`. Faults, panics included, are
    /// converted into an error response here and never escape.
    pub fn dispatch(&self, request: Request) -> Reply {
        let command = request.command().to_string();

        if self.is_disconnect(&command) {
            return Reply::Single(
                catch_fault(|| (self.disconnect_handler)(request))
                    .unwrap_or_else(|err| self.error_response(&command, &err)),
            );
        }

        let result = match &self.lookup(&command).handler {
            Handler::Single(handler) => catch_fault(|| handler(request)).map(Reply::Single),
            Handler::Stream(handler) => catch_fault(|| handler(request)).map(Reply::Stream),
        };
        result.unwrap_or_else(|err| Reply::Single(self.error_response(&command, &err)))
    }

    /// Response for a handler fault, via the error handler chain.
    pub fn error_response(&self, command: &str, err: &HandlerError) -> Response {
        tracing::warn!(command = %command, error = %err, "Handler fault");
        if let Some(handler) = &self.error_handler {
            match catch_fault(|| handler(command, err)) {
                Ok(response) => return response,
                Err(nested) => {
                    tracing::warn!(command = %command, error = %nested, "Error handler failed");
                }
            }
        }
        Response::error(err.kind(), err.message())
    }

    /// Response for a recoverable protocol usage error.
    pub fn usage_error_response(&self, err: &ProtocolError) -> Response {
        self.error_response("", &HandlerError::new(err.kind(), err.to_string()))
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .field("disconnect_command", &self.disconnect_command)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}
