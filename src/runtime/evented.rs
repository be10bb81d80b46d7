//! Event-driven runtime on tokio.
//!
//! Connections are tasks rather than threads. "Receive more bytes" is an
//! awaited read that suspends the task; the per-connection state lives in
//! the same [`Connection`] the threaded runtime uses, so the bytes on the
//! wire are identical.

use super::{bind_listener, ConnectionError};
use crate::server::lifecycle::{Action, Connection};
use crate::server::registry::CommandRegistry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Run `conn` over an async byte stream until disconnect or a fatal error.
pub async fn drive<S>(stream: &mut S, conn: &mut Connection) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match conn.next_action()? {
            Action::Receive => {
                let read = stream.read(conn.reader_mut().receive_buffer()).await;
                let n = match read {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        conn.terminate();
                        return Err(e.into());
                    }
                };
                conn.reader_mut().commit(n);
                if n == 0 {
                    conn.peer_closed();
                    return Ok(());
                }
            }
            Action::Send(bytes) => {
                let written = async {
                    stream.write_all(&bytes).await?;
                    stream.flush().await
                }
                .await;
                if let Err(e) = written {
                    conn.terminate();
                    return Err(e.into());
                }
            }
            Action::Close => return Ok(()),
        }
    }
}

/// A listening server that runs each connection as a tokio task.
pub struct EventedServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

impl EventedServer {
    /// Bind `addr` and spawn the accept loop on the current runtime.
    pub async fn bind(addr: SocketAddr, registry: Arc<CommandRegistry>) -> io::Result<Self> {
        let listener = bind_listener(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(accept_loop(listener, registry, shutdown_rx));

        info!(address = %local_addr, runtime = "evented", "Server listening");
        Ok(Self {
            local_addr,
            shutdown_tx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to finish.
    pub async fn join(self) {
        let _ = self.acceptor.await;
    }

    /// Stop accepting. Connections already running finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.acceptor.await;
        info!(address = %self.local_addr, "Server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<CommandRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    tokio::spawn(serve(stream, addr, Arc::clone(&registry)));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, registry: Arc<CommandRegistry>) {
    let mut conn = Connection::new(registry, Some(peer));
    if let Err(e) = drive(&mut stream, &mut conn).await {
        debug!(peer = %peer, error = %e, "Connection error");
    }
    let _ = stream.shutdown().await;
    debug!(peer = %peer, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataExpectation, ProtocolError, Response};
    use crate::server::registry::{HandlerResult, ResponseStream};
    use tokio_test::io::Builder;

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
                })
                .streaming("MULTI", DataExpectation::Never, |req| {
                    let mut items: Vec<HandlerResult<Response>> = req
                        .arguments()
                        .iter()
                        .map(|a| Ok(Response::builder("VALUE").arg(a.clone()).build()))
                        .collect();
                    items.push(Ok(Response::status_only("END")));
                    Ok(Box::new(items.into_iter()) as ResponseStream)
                }),
        )
    }

    #[tokio::test]
    async fn test_drive_split_reads() {
        let mut stream = Builder::new()
            .read(b"SET key 0 0 5\r")
            .read(b"\nhello\r")
            .read(b"\n")
            .write(b"STORED\r\n")
            .read(b"MULTI foo bar\r\n")
            .write(b"VALUE foo\r\n")
            .write(b"VALUE bar\r\n")
            .write(b"END\r\n")
            .build();
        let mut conn = Connection::new(registry(), None);
        drive(&mut stream, &mut conn).await.unwrap();
        assert!(conn.is_terminated());
    }

    #[tokio::test]
    async fn test_drive_missing_trailer() {
        let mut stream = Builder::new().read(b"SET key 0 0 2\r\nhi\rX").build();
        let mut conn = Connection::new(registry(), None);
        let err = drive(&mut stream, &mut conn).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::DataTerminatorMissing)
        ));
    }

    #[tokio::test]
    async fn test_drive_read_error() {
        let mut stream = Builder::new()
            .read(b"ECHO a\r\n")
            .write(b"ECHO a\r\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut conn = Connection::new(registry(), None);
        let err = drive(&mut stream, &mut conn).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
        assert!(conn.is_terminated());
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let server = EventedServer::bind("127.0.0.1:0".parse().unwrap(), registry())
            .await
            .unwrap();
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"ECHO foo bar\r\nbye\r\n").await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ECHO foo bar\r\nBYE\r\n");
        server.shutdown().await;
    }
}
