//! Thread-per-connection runtime.
//!
//! Each accepted connection gets a dedicated OS thread. "Receive more
//! bytes" is a blocking `read` into the connection's frame reader.

use super::{bind_listener, ConnectionError};
use crate::server::lifecycle::{Action, Connection};
use crate::server::registry::CommandRegistry;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Run `conn` over a blocking byte stream until disconnect or a fatal error.
pub fn drive<S: Read + Write>(
    stream: &mut S,
    conn: &mut Connection,
) -> Result<(), ConnectionError> {
    loop {
        match conn.next_action()? {
            Action::Receive => {
                let n = match conn.reader_mut().fill_from(stream) {
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        conn.terminate();
                        return Err(e.into());
                    }
                };
                if n == 0 {
                    conn.peer_closed();
                    return Ok(());
                }
            }
            Action::Send(bytes) => {
                if let Err(e) = stream.write_all(&bytes).and_then(|()| stream.flush()) {
                    conn.terminate();
                    return Err(e.into());
                }
            }
            Action::Close => return Ok(()),
        }
    }
}

/// A listening server that spawns one thread per connection.
pub struct ThreadedServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ThreadedServer {
    /// Bind `addr` and start accepting on a background thread.
    pub fn bind(addr: SocketAddr, registry: Arc<CommandRegistry>) -> io::Result<Self> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let acceptor = thread::Builder::new()
            .name("textwire-accept".to_string())
            .spawn(move || accept_loop(listener, registry, flag))?;

        info!(address = %local_addr, runtime = "threaded", "Server listening");
        Ok(Self {
            local_addr,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until the accept loop exits.
    pub fn join(mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }

    /// Stop accepting. Connections already running finish on their own.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            // Wake the blocking accept.
            let _ = TcpStream::connect(self.local_addr);
            let _ = acceptor.join();
            info!(address = %self.local_addr, "Server stopped");
        }
    }
}

impl Drop for ThreadedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, registry: Arc<CommandRegistry>, shutdown: Arc<AtomicBool>) {
    let mut next_id: u64 = 0;
    for incoming in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        next_id += 1;
        let spawned = thread::Builder::new()
            .name(format!("textwire-conn-{next_id}"))
            .spawn(move || serve(stream, registry));
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn connection thread");
        }
    }
}

fn serve(mut stream: TcpStream, registry: Arc<CommandRegistry>) {
    let peer = stream.peer_addr().ok();
    debug!(peer = ?peer, "New connection");

    let mut conn = Connection::new(registry, peer);
    if let Err(e) = drive(&mut stream, &mut conn) {
        debug!(peer = ?peer, error = %e, "Connection error");
    }
    let _ = stream.shutdown(Shutdown::Both);
    debug!(peer = ?peer, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataExpectation, ProtocolError, Response};
    use std::io::Cursor;

    /// In-memory duplex: reads come from scripted chunks, writes are kept.
    struct Scripted {
        chunks: Vec<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Scripted {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                chunks: chunks.iter().rev().map(|c| c.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop() {
                Some(chunk) => Cursor::new(chunk).read(buf),
                None => Ok(0),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn registry() -> Arc<CommandRegistry> {
        Arc::new(
            CommandRegistry::new()
                .default_handler(|req| {
                    Ok(Response::builder(req.command())
                        .args(req.arguments().iter().cloned())
                        .build())
                })
                .command("SET", DataExpectation::Auto, |_| {
                    Ok(Response::status_only("STORED"))
                }),
        )
    }

    #[test]
    fn test_drive_split_frames() {
        let mut stream = Scripted::new(&[b"SET key 0 0 5\r", b"\nhel", b"lo\r", b"\nECHO a b\r\n"]);
        let mut conn = Connection::new(registry(), None);
        drive(&mut stream, &mut conn).unwrap();
        assert_eq!(stream.written, b"STORED\r\nECHO a b\r\n");
        assert!(conn.is_terminated());
    }

    #[test]
    fn test_drive_stops_on_framing_error() {
        let mut stream = Scripted::new(&[b"PING\rX\n", b"ECHO never\r\n"]);
        let mut conn = Connection::new(registry(), None);
        let err = drive(&mut stream, &mut conn).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::IncompleteCommandTerminator)
        ));
        assert!(stream.written.is_empty());
    }

    #[test]
    fn test_server_round_trip() {
        let server = ThreadedServer::bind("127.0.0.1:0".parse().unwrap(), registry()).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"ECHO foo bar\r\nBYE\r\n").unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"ECHO foo bar\r\nBYE\r\n");
        server.shutdown();
    }
}
