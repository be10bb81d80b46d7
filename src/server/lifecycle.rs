//! Per-connection request/response state machine.
//!
//! [`Connection`] holds everything a single connection needs between I/O
//! calls: the frame reader and the response currently being sent. It does
//! no I/O; a driver repeatedly calls [`Connection::next_action`] and does
//! what the returned [`Action`] says:
//!
//! ```text
//!   AwaitingCommandLine ──line──▶ AwaitingPayload ──payload──┐
//!          ▲    │                                            ▼
//!          │    └──────────── no payload ──────────▶ Dispatching
//!          │                                                 │
//!          └──── stream done ──── Sending ◀──────────────────┘
//!                                    │
//!                                    └── disconnect ──▶ Terminated
//! ```
//!
//! Commands are strictly sequential: the next line is not read until every
//! response of the current command has been handed to the driver and the
//! driver has come back for more.

use crate::instrument::emit;
use crate::protocol::{Frame, FrameReader, ProtocolError, Request, Response};
use crate::server::registry::{catch_fault, CommandRegistry, Reply, ResponseStream};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// What the driver must do next.
#[derive(Debug)]
pub enum Action {
    /// Receive more bytes into [`Connection::reader_mut`].
    Receive,
    /// Write these bytes completely, then ask again.
    Send(BytesMut),
    /// Close the connection.
    Close,
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    AwaitingCommandLine,
    AwaitingPayload,
    Sending,
    Terminated,
}

enum State {
    AwaitingCommandLine,
    Sending(Outgoing),
    Terminated,
}

/// Responses still owed for the command being answered.
struct Outgoing {
    command: String,
    started: Instant,
    disconnect: bool,
    pending: Pending,
}

enum Pending {
    Single(Option<Response>),
    Stream(Option<ResponseStream>),
}

impl Outgoing {
    fn new(command: String, reply: Reply, disconnect: bool) -> Self {
        let pending = match reply {
            Reply::Single(response) => Pending::Single(Some(response)),
            Reply::Stream(stream) => Pending::Stream(Some(stream)),
        };
        Self {
            command,
            started: Instant::now(),
            disconnect,
            pending,
        }
    }

    /// Pull the next response. A fault or panic inside a stream is
    /// answered with an error response and ends the stream.
    fn next_response(&mut self, registry: &CommandRegistry) -> Option<Response> {
        match &mut self.pending {
            Pending::Single(response) => response.take(),
            Pending::Stream(slot) => {
                let stream = slot.as_mut()?;
                let item = match catch_fault(|| Ok(stream.next())) {
                    Ok(item) => item,
                    Err(err) => Some(Err(err)),
                };
                match item {
                    Some(Ok(response)) => Some(response),
                    Some(Err(err)) => {
                        *slot = None;
                        Some(registry.error_response(&self.command, &err))
                    }
                    None => {
                        *slot = None;
                        None
                    }
                }
            }
        }
    }
}

/// State for one server-side connection.
pub struct Connection {
    registry: Arc<CommandRegistry>,
    reader: FrameReader,
    state: State,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(registry: Arc<CommandRegistry>, peer: Option<SocketAddr>) -> Self {
        emit(registry.sink(), |s| s.connection_opened(peer));
        let reader = FrameReader::new().max_payload(registry.payload_limit());
        Self {
            registry,
            reader,
            state: State::AwaitingCommandLine,
            peer,
        }
    }

    /// The reader to receive bytes into when asked to [`Action::Receive`].
    pub fn reader_mut(&mut self) -> &mut FrameReader {
        &mut self.reader
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> LifecycleState {
        match self.state {
            State::AwaitingCommandLine if self.reader.is_reading_payload() => {
                LifecycleState::AwaitingPayload
            }
            State::AwaitingCommandLine => LifecycleState::AwaitingCommandLine,
            State::Sending(_) => LifecycleState::Sending,
            State::Terminated => LifecycleState::Terminated,
        }
    }

    /// Advance the state machine until it needs I/O.
    ///
    /// A fatal protocol error terminates the connection and is returned;
    /// the driver should close without writing anything further.
    pub fn next_action(&mut self) -> Result<Action, ProtocolError> {
        loop {
            match self.state {
                State::Terminated => return Ok(Action::Close),
                State::Sending(ref mut outgoing) => {
                    if let Some(response) = outgoing.next_response(&self.registry) {
                        trace!(peer = ?self.peer, status = %response.status(), "Sending response");
                        return Ok(Action::Send(response.encode()));
                    }
                    let elapsed = outgoing.started.elapsed();
                    let disconnect = outgoing.disconnect;
                    let command = std::mem::take(&mut outgoing.command);
                    emit(self.registry.sink(), |s| s.command_completed(&command, elapsed));
                    self.state = if disconnect {
                        debug!(peer = ?self.peer, "Disconnect requested");
                        State::Terminated
                    } else {
                        State::AwaitingCommandLine
                    };
                }
                State::AwaitingCommandLine => {
                    let registry = Arc::clone(&self.registry);
                    match self.reader.next_frame(|name| registry.expectation_for(name)) {
                        Ok(Some(frame)) => self.dispatch(frame),
                        Ok(None) => return Ok(Action::Receive),
                        Err(err) if !err.is_fatal() => {
                            debug!(peer = ?self.peer, error = %err, "Rejected command line");
                            let response = registry.usage_error_response(&err);
                            self.state = State::Sending(Outgoing::new(
                                String::new(),
                                Reply::Single(response),
                                false,
                            ));
                        }
                        Err(err) => {
                            warn!(peer = ?self.peer, error = %err, "Framing error");
                            self.terminate();
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let sink = self.registry.sink();
        emit(sink, |s| s.command_received(&frame.name));
        trace!(peer = ?self.peer, command = %frame.name, "Dispatching");

        let disconnect = self.registry.is_disconnect(&frame.name);
        let command = frame.name.clone();
        let request = Request::from_parts(frame.name, frame.arguments, frame.payload);

        emit(sink, |s| s.command_dispatched(&command));
        let reply = self.registry.dispatch(request);
        self.state = State::Sending(Outgoing::new(command, reply, disconnect));
    }

    /// The peer closed its side. Not an error, but logged if a frame was
    /// only partially received.
    pub fn peer_closed(&mut self) {
        if !self.reader.is_idle() {
            debug!(peer = ?self.peer, "Peer closed mid-frame");
        }
        self.terminate();
    }

    /// Move to `Terminated` and drop buffered state.
    pub fn terminate(&mut self) {
        self.state = State::Terminated;
        self.reader.reset();
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, State::Terminated)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let peer = self.peer;
        emit(self.registry.sink(), |s| s.connection_closed(peer));
    }
}
