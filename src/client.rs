//! Blocking client executor.
//!
//! A [`Client`] borrows a socket from its [`Pool`] for each call, writes the
//! encoded request and parses the reply with a [`FrameReader`] that is reset
//! for every attempt. When
//! the socket turns out to be dead (a write fails, the peer hung up, or the
//! pool handed out a socket that was already disposed) the call is retried
//! once on a new socket.

use crate::pool::{Pool, PoolError, PoolRegistry, PooledConnection};
use crate::protocol::{
    DataExpectation, FrameReader, MultiRequest, ProtocolError, Request, Response,
    DEFAULT_MAX_PAYLOAD, ERROR_STATUS,
};
use std::collections::HashMap;
use std::io::{self, Write};
use tracing::{debug, warn};

/// Receive buffer for response parsing (4 KiB).
const RESPONSE_BUFFER_SIZE: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ClientError {
    /// Failures of the socket itself, as opposed to the conversation on it.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Closed)
    }
}

/// Synchronous request executor over a socket pool.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Pool,
    retry: bool,
    expectations: HashMap<String, DataExpectation>,
    max_payload: usize,
}

impl Client {
    pub fn new(pool: Pool) -> Self {
        let mut expectations = HashMap::new();
        expectations.insert(ERROR_STATUS.to_string(), DataExpectation::Always);
        Self {
            pool,
            retry: true,
            expectations,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// A client on the shared pool for `host:port`.
    pub fn connect(registry: &PoolRegistry, host: &str, port: u16) -> io::Result<Self> {
        Ok(Self::new(registry.get(host, port)?))
    }

    /// Enable or disable the single retry on connection failure.
    pub fn retry(mut self, enabled: bool) -> Self {
        self.retry = enabled;
        self
    }

    /// Payload policy for response lines with `status`. Unlisted statuses use `Auto`.
    pub fn expect(mut self, status: impl Into<String>, expectation: DataExpectation) -> Self {
        self.expectations.insert(status.into(), expectation);
        self
    }

    /// Largest payload a response may declare before the call fails with
    /// `PayloadTooLarge`.
    pub fn max_payload(mut self, limit: usize) -> Self {
        self.max_payload = limit;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn expectation_for(&self, status: &str) -> DataExpectation {
        self.expectations.get(status).copied().unwrap_or_default()
    }

    /// Send `request` and read a single response.
    pub fn exec(&self, request: &Request) -> Result<Response, ClientError> {
        self.run(request, |conn, reader| {
            let response = self.read_response(conn, reader)?;
            Ok(response)
        })
    }

    /// Send `request` and collect responses up to and including its terminator.
    ///
    /// A status that is neither expected nor the terminator ends collection,
    /// and that response alone is returned.
    pub fn exec_multi(&self, request: &MultiRequest) -> Result<Vec<Response>, ClientError> {
        self.run(request.request(), |conn, reader| {
            let mut responses = Vec::new();
            loop {
                let response = self.read_response(conn, reader)?;
                if response.status() == request.terminator() {
                    responses.push(response);
                    return Ok(responses);
                }
                if !request.expects(response.status()) {
                    debug!(status = response.status(), "Unexpected status in multi-response");
                    // The rest of the stream is unread.
                    conn.discard();
                    return Ok(vec![response]);
                }
                responses.push(response);
            }
        })
    }

    fn run<T, F>(&self, request: &Request, read: F) -> Result<T, ClientError>
    where
        F: Fn(&mut PooledConnection, &mut FrameReader) -> Result<T, ClientError>,
    {
        let encoded = request.encode();
        let mut reader =
            FrameReader::with_capacity(RESPONSE_BUFFER_SIZE).max_payload(self.max_payload);
        let mut first_attempt = true;
        loop {
            let mut conn = self.pool.acquire()?;
            reader.reset();

            let result = conn
                .write_all(&encoded)
                .and_then(|_| conn.flush())
                .map_err(ClientError::from)
                .and_then(|_| read(&mut conn, &mut reader));

            match result {
                Ok(value) => {
                    if reader.has_buffered() {
                        debug!(endpoint = self.pool.endpoint(), "Unread bytes after response");
                        conn.discard();
                    }
                    return Ok(value);
                }
                Err(e) => {
                    conn.discard();
                    drop(conn);
                    if first_attempt && self.retry && e.is_connection_level() {
                        warn!(
                            endpoint = self.pool.endpoint(),
                            command = request.command(),
                            error = %e,
                            "Retrying on a fresh socket"
                        );
                        first_attempt = false;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn read_response(
        &self,
        conn: &mut PooledConnection,
        reader: &mut FrameReader,
    ) -> Result<Response, ClientError> {
        loop {
            if let Some(frame) = reader.next_frame(|status| self.expectation_for(status))? {
                return Ok(Response::from_parts(frame.name, frame.arguments, frame.payload));
            }
            if reader.fill_from(conn)? == 0 {
                return Err(ClientError::Closed);
            }
        }
    }
}
