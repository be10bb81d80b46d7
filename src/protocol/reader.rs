//! Incremental frame reader.
//!
//! `FrameReader` owns a fixed receive buffer and the partial state that has
//! to survive between socket reads: the carried-over line text, whether the
//! last scanned byte was a lone `\r`, and how much payload is still owed.
//! It performs no I/O itself. A driver asks it for the next frame, and when
//! the answer is "not yet" it receives more bytes into [`FrameReader::receive_buffer`]
//! and reports the count through [`FrameReader::commit`]. The blocking and
//! the tokio drivers use it the same way.
//!
//! ```text
//!   Line ──\r\n──▶ Payload(remaining) ──0──▶ Trailer ──\r\n──▶ Line
//!     │                                                    ▲
//!     └──────────────── no length token ───────────────────┘
//! ```

use super::codec::{tokenize, CommandLine, DataExpectation};
use super::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Default receive buffer size (16 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default cap on a declared payload length (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// One decoded frame: a command or status line and its optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub arguments: Vec<String>,
    pub payload: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Line,
    Payload { declared: usize, remaining: usize },
    Trailer { declared: usize },
}

/// Per-connection incremental parser state.
pub struct FrameReader {
    buffer: Box<[u8]>,
    position: usize,
    filled: usize,
    line: Vec<u8>,
    pending_cr: bool,
    phase: Phase,
    pending: Option<CommandLine>,
    payload: BytesMut,
    max_payload: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            position: 0,
            filled: 0,
            line: Vec::new(),
            pending_cr: false,
            phase: Phase::Line,
            pending: None,
            payload: BytesMut::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Reject command lines declaring more than `limit` payload bytes.
    pub fn max_payload(mut self, limit: usize) -> Self {
        self.max_payload = limit;
        self
    }

    /// Unconsumed bytes are sitting in the buffer.
    pub fn has_buffered(&self) -> bool {
        self.position < self.filled
    }

    /// No partial frame is held: the next byte starts a new line.
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Line
            && self.line.is_empty()
            && !self.pending_cr
            && !self.has_buffered()
    }

    /// Whether the reader is accumulating a payload or its trailer.
    pub fn is_reading_payload(&self) -> bool {
        self.phase != Phase::Line
    }

    /// Space to receive the next chunk into.
    ///
    /// Any unconsumed bytes are moved to the front first, so the slice
    /// returned always follows the data already buffered.
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        if self.has_buffered() {
            self.buffer.copy_within(self.position..self.filled, 0);
            self.filled -= self.position;
        } else {
            self.filled = 0;
        }
        self.position = 0;
        &mut self.buffer[self.filled..]
    }

    /// Record that `n` bytes were written into the last [`receive_buffer`](Self::receive_buffer).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buffer.len());
        self.filled += n;
    }

    /// Receive one chunk from a blocking source. Returns the byte count,
    /// zero meaning the peer closed.
    pub fn fill_from<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let n = source.read(self.receive_buffer())?;
        self.commit(n);
        Ok(n)
    }

    /// Copy a chunk into the buffer. Used where bytes arrive from elsewhere.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        let spare = self.receive_buffer();
        let n = chunk.len().min(spare.len());
        spare[..n].copy_from_slice(&chunk[..n]);
        self.commit(n);
        n
    }

    /// Scan buffered bytes for the next frame.
    ///
    /// `expectation` maps the line's first token to its payload policy.
    /// Returns `Ok(None)` once the buffer is exhausted without completing
    /// a frame; partial state is kept for the next chunk. A usage error
    /// (`InvalidCommand`, `EmptyCommand`) consumes the line and leaves the
    /// reader ready for the next one. A declared length above the
    /// configured limit is `PayloadTooLarge`, raised before any payload
    /// byte is buffered.
    pub fn next_frame<F>(&mut self, expectation: F) -> Result<Option<Frame>, ProtocolError>
    where
        F: Fn(&str) -> DataExpectation,
    {
        if self.phase == Phase::Line {
            let tokens = match self.next_line()? {
                Some(tokens) => tokens,
                None => return Ok(None),
            };
            let policy = match tokens.first() {
                Some(name) => expectation(name),
                None => DataExpectation::Never,
            };
            let line = policy.resolve(tokens)?;
            match line.data_length {
                Some(length) => {
                    self.begin_payload(length)?;
                    self.pending = Some(line);
                }
                None => {
                    return Ok(Some(Frame {
                        name: line.name,
                        arguments: line.arguments,
                        payload: None,
                    }))
                }
            }
        }

        match self.next_payload()? {
            Some(payload) => {
                let line = self.pending.take().ok_or(ProtocolError::DataTerminatorMissing)?;
                Ok(Some(Frame {
                    name: line.name,
                    arguments: line.arguments,
                    payload: Some(payload),
                }))
            }
            None => Ok(None),
        }
    }

    /// Scan for a `\r\n` terminated line and return its tokens.
    pub fn next_line(&mut self) -> Result<Option<Vec<String>>, ProtocolError> {
        while self.position < self.filled {
            if self.pending_cr {
                let byte = self.buffer[self.position];
                self.position += 1;
                self.pending_cr = false;
                if byte != b'\n' {
                    return Err(ProtocolError::IncompleteCommandTerminator);
                }
                let tokens = tokenize(&self.line);
                self.line.clear();
                return tokens.map(Some);
            }

            let window = &self.buffer[self.position..self.filled];
            match window.iter().position(|&b| b == b'\r') {
                Some(at) => {
                    self.line.extend_from_slice(&window[..at]);
                    self.position += at + 1;
                    self.pending_cr = true;
                }
                None => {
                    self.line.extend_from_slice(window);
                    self.position = self.filled;
                }
            }
        }
        Ok(None)
    }

    /// Start accumulating a payload of `length` bytes. The buffer grows
    /// as the bytes arrive.
    pub fn begin_payload(&mut self, length: usize) -> Result<(), ProtocolError> {
        if length > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                declared: length,
                limit: self.max_payload,
            });
        }
        self.payload.clear();
        self.phase = if length == 0 {
            Phase::Trailer { declared: 0 }
        } else {
            Phase::Payload {
                declared: length,
                remaining: length,
            }
        };
        Ok(())
    }

    /// Copy owed payload bytes and consume the trailer.
    pub fn next_payload(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if let Phase::Payload {
            declared,
            remaining,
        } = self.phase
        {
            let take = remaining.min(self.filled - self.position);
            self.payload.reserve(take);
            self.payload
                .extend_from_slice(&self.buffer[self.position..self.position + take]);
            self.position += take;
            let remaining = remaining - take;
            if remaining > 0 {
                self.phase = Phase::Payload {
                    declared,
                    remaining,
                };
                return Ok(None);
            }
            self.phase = Phase::Trailer { declared };
        }

        let declared = match self.phase {
            Phase::Trailer { declared } => declared,
            _ => return Ok(None),
        };

        while self.position < self.filled {
            let byte = self.buffer[self.position];
            self.position += 1;
            if self.pending_cr {
                self.pending_cr = false;
                if byte != b'\n' {
                    return Err(ProtocolError::DataTerminatorMissing);
                }
                self.phase = Phase::Line;
                let payload = self.payload.split().freeze();
                if payload.len() != declared {
                    return Err(ProtocolError::PayloadLengthMismatch {
                        declared,
                        received: payload.len(),
                    });
                }
                return Ok(Some(payload));
            }
            match byte {
                b'\r' => self.pending_cr = true,
                b'\n' => return Err(ProtocolError::DataTerminatorMissing),
                _ => return Err(ProtocolError::PayloadOverrun { declared }),
            }
        }
        Ok(None)
    }

    /// Drop all partial state and buffered bytes.
    pub fn reset(&mut self) {
        self.position = 0;
        self.filled = 0;
        self.line.clear();
        self.pending_cr = false;
        self.phase = Phase::Line;
        self.pending = None;
        self.payload.clear();
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("capacity", &self.buffer.len())
            .field("buffered", &(self.filled - self.position))
            .field("line", &self.line.len())
            .field("pending_cr", &self.pending_cr)
            .field("phase", &self.phase)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}
