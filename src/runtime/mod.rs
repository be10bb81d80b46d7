//! Server runtimes.
//!
//! Two interchangeable scheduling models drive the same per-connection
//! state machine:
//! - `threaded`: one blocking OS thread per connection
//! - `evented`: tokio tasks suspended on async reads and writes
//!
//! Both produce byte-identical wire behaviour.

pub mod evented;
pub mod threaded;

pub use evented::EventedServer;
pub use threaded::ThreadedServer;

use crate::protocol::ProtocolError;
use crate::server::registry::CommandRegistry;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Which scheduling model serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Thread per connection, blocking reads.
    #[default]
    Threaded,
    /// Tokio tasks, async reads.
    Evented,
}

/// Errors that end a server-side connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Bind a listening socket with `SO_REUSEADDR` set.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Serve `registry` on `listen` until the process exits.
pub fn run(
    runtime: RuntimeType,
    listen: SocketAddr,
    workers: Option<usize>,
    registry: Arc<CommandRegistry>,
) -> io::Result<()> {
    match runtime {
        RuntimeType::Threaded => {
            let server = ThreadedServer::bind(listen, registry)?;
            server.join();
            Ok(())
        }
        RuntimeType::Evented => {
            let workers = workers.unwrap_or_else(num_cpus);
            info!(workers, "Starting tokio runtime");
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(workers.max(1))
                .thread_name("textwire-worker")
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let server = EventedServer::bind(listen, registry).await?;
                server.join().await;
                Ok(())
            })
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DataExpectation, Response};
    use crate::server::registry::{HandlerResult, ResponseStream};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn registry() -> Arc<CommandRegistry> {
        Arc::new(
            CommandRegistry::new()
                .default_handler(|req| {
                    Ok(Response::builder(req.command())
                        .args(req.arguments().iter().cloned())
                        .build())
                })
                .command("SET", DataExpectation::Auto, |req| {
                    let key = req.arguments().first().cloned().unwrap_or_default();
                    Ok(Response::builder("STORED").arg(key).build())
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

    const SCRIPT: &[&[u8]] = &[
        b"ECHO foo bar\r\nSET k",
        b"ey 0 0 5\r",
        b"\nhel",
        b"lo\r\nMULTI a b\r\n",
        b"\r\nSET x\r\n",
        b"BYE\r\n",
    ];

    fn exchange(addr: SocketAddr) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_nodelay(true).unwrap();
        for chunk in SCRIPT {
            client.write_all(chunk).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        received
    }

    #[test]
    fn test_runtimes_are_byte_identical() {
        let threaded = ThreadedServer::bind("127.0.0.1:0".parse().unwrap(), registry()).unwrap();
        let from_threaded = exchange(threaded.local_addr());
        threaded.shutdown();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let evented = rt
            .block_on(EventedServer::bind("127.0.0.1:0".parse().unwrap(), registry()))
            .unwrap();
        let from_evented = exchange(evented.local_addr());
        rt.block_on(evented.shutdown());

        assert_eq!(from_threaded, from_evented);
        let text = String::from_utf8(from_threaded).unwrap();
        assert!(text.starts_with("ECHO foo bar\r\nSTORED key\r\nVALUE a\r\nVALUE b\r\nEND\r\n"));
        assert!(text.contains("ERROR EmptyCommand "));
        assert!(text.ends_with("STORED x\r\nBYE\r\n"));
    }

    #[test]
    fn test_runtime_type_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            runtime: RuntimeType,
        }
        let parsed: Wrapper = toml::from_str("runtime = \"evented\"").unwrap();
        assert_eq!(parsed.runtime, RuntimeType::Evented);
    }
}
