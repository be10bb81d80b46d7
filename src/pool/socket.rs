//! Pooled sockets and the handles lent out to callers.

use super::{PoolError, Shared};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A duplex byte stream the pool can manage.
pub trait Transport: Read + Write + Send {
    /// Whether the peer still appears connected. Must not consume data.
    fn is_connected(&self) -> bool {
        true
    }

    /// Close the underlying connection.
    fn close(&mut self) {}
}

impl Transport for TcpStream {
    fn is_connected(&self) -> bool {
        if self.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let connected = match self.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == ErrorKind::WouldBlock,
        };
        self.set_nonblocking(false).is_ok() && connected
    }

    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Opens new transports for a pool.
pub trait Connector: Send + Sync {
    /// Connect within `timeout`.
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>, PoolError>;

    /// Human-readable endpoint, used in logs and events.
    fn endpoint(&self) -> &str;
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>, PoolError> {
        (**self).connect(timeout)
    }

    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }
}

/// Connects plain TCP sockets to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    endpoint: String,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let endpoint = format!("{host}:{port}");
        Self {
            host,
            port,
            endpoint,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>, PoolError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(PoolError::Connect)?;

        let mut last = PoolError::Connect(io::Error::new(
            ErrorKind::AddrNotAvailable,
            format!("{} resolved to no addresses", self.endpoint),
        ));
        for addr in addrs {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(PoolError::Connect)?;
            match socket.connect_timeout(&addr.into(), timeout) {
                Ok(()) => {
                    socket.set_nodelay(true).map_err(PoolError::Connect)?;
                    return Ok(Box::new(TcpStream::from(socket)));
                }
                // The half-open socket is closed when `socket` drops.
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    last = PoolError::TimedOut { timeout };
                }
                Err(e) => last = PoolError::Connect(e),
            }
        }
        Err(last)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Liveness flag shared between a socket and the pool's busy table.
#[derive(Debug, Default)]
pub(crate) struct SocketStatus {
    disposed: AtomicBool,
}

impl SocketStatus {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// A transport owned by the pool.
pub(crate) struct PooledSocket {
    pub(crate) id: u64,
    transport: Box<dyn Transport>,
    pub(crate) status: Arc<SocketStatus>,
}

impl PooledSocket {
    pub(crate) fn new(id: u64, transport: Box<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            status: Arc::new(SocketStatus::default()),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.status.is_disposed()
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.is_disposed() && self.transport.is_connected()
    }

    pub(crate) fn close(mut self) {
        self.status.dispose();
        self.transport.close();
    }
}

impl fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSocket")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A socket on loan from a [`Pool`](super::Pool).
///
/// Reads and writes go to the underlying transport. Dropping the handle
/// gives the socket back to the pool instead of closing it, unless the
/// socket failed or was discarded.
pub struct PooledConnection {
    socket: Option<PooledSocket>,
    key: usize,
    shared: Arc<Shared>,
}

impl PooledConnection {
    pub(crate) fn new(key: usize, socket: PooledSocket, shared: Arc<Shared>) -> Self {
        Self {
            socket: Some(socket),
            key,
            shared,
        }
    }

    /// Pool-unique id of the underlying socket.
    pub fn id(&self) -> u64 {
        self.socket.as_ref().map_or(0, |s| s.id)
    }

    /// Mark the socket as failed so it is closed rather than reused.
    pub fn discard(&mut self) {
        if let Some(socket) = &self.socket {
            socket.status.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.socket.as_ref().map_or(true, PooledSocket::is_disposed)
    }

    fn live(&mut self) -> io::Result<&mut PooledSocket> {
        match self.socket.as_mut() {
            Some(socket) if !socket.is_disposed() => Ok(socket),
            _ => Err(io::Error::new(ErrorKind::NotConnected, "socket disposed")),
        }
    }
}

/// Any I/O error other than an interrupt leaves the stream in an unknown
/// state, so the socket is disposed.
fn track<T>(socket: &PooledSocket, result: io::Result<T>) -> io::Result<T> {
    if let Err(e) = &result {
        if e.kind() != ErrorKind::Interrupted {
            socket.status.dispose();
        }
    }
    result
}

impl Read for PooledConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self.live()?;
        let result = socket.transport.read(buf);
        track(socket, result)
    }
}

impl Write for PooledConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let socket = self.live()?;
        let result = socket.transport.write(buf);
        track(socket, result)
    }

    fn flush(&mut self) -> io::Result<()> {
        let socket = self.live()?;
        let result = socket.transport.flush();
        track(socket, result)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.shared.reclaim(self.key, socket);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("socket", &self.socket)
            .field("key", &self.key)
            .finish()
    }
}
