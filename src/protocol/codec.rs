//! Frame codec for the text protocol.
//!
//! A frame is one line of space separated tokens terminated by `\r\n`,
//! optionally followed by a payload of declared length and a second
//! `\r\n` trailer:
//!
//! ```text
//! <TOKEN> (" " <TOKEN>)* "\r\n"
//! [<payload bytes of declared length> "\r\n"]
//! ```
//!
//! When a payload is present its length is the final token of the line.
//! Whether the final token is read as a length is decided per command by
//! [`DataExpectation`].

use super::error::ProtocolError;
use bytes::{BufMut, BytesMut};

/// Line and payload terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Per-command policy for reading the trailing token as a payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataExpectation {
    /// Read the last token as a length if it parses, otherwise no payload.
    #[default]
    Auto,
    /// The last token must be a length.
    Always,
    /// Every token is an argument and no payload follows.
    Never,
}

/// A command or status line after the data expectation has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Command name (or response status).
    pub name: String,
    /// Remaining tokens, without the length token.
    pub arguments: Vec<String>,
    /// Declared payload length, if a payload follows the line.
    pub data_length: Option<usize>,
}

impl DataExpectation {
    /// Split `tokens` into name, arguments and declared payload length.
    pub fn resolve(self, mut tokens: Vec<String>) -> Result<CommandLine, ProtocolError> {
        if tokens.is_empty() {
            return Err(ProtocolError::EmptyCommand);
        }
        let name = tokens.remove(0);
        let mut arguments = tokens;

        let data_length = match self {
            DataExpectation::Never => None,
            DataExpectation::Auto => match arguments.last().and_then(|t| t.parse().ok()) {
                Some(length) => {
                    arguments.pop();
                    Some(length)
                }
                None => None,
            },
            DataExpectation::Always => {
                let length = arguments
                    .last()
                    .and_then(|t| t.parse::<usize>().ok())
                    .ok_or_else(|| {
                        ProtocolError::InvalidCommand(format!(
                            "{name} requires a trailing data length"
                        ))
                    })?;
                arguments.pop();
                Some(length)
            }
        };

        Ok(CommandLine {
            name,
            arguments,
            data_length,
        })
    }
}

/// Split a raw line (without its terminator) into tokens.
///
/// Tokens are separated by single spaces; empty tokens are dropped.
pub fn tokenize(line: &[u8]) -> Result<Vec<String>, ProtocolError> {
    let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(line
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect())
}

/// Encode a frame into a fresh buffer.
pub fn encode(name: &str, arguments: &[String], payload: Option<&[u8]>) -> BytesMut {
    let mut dst = BytesMut::with_capacity(encoded_len(name, arguments, payload));
    encode_into(&mut dst, name, arguments, payload);
    dst
}

/// Append an encoded frame to `dst`.
pub fn encode_into(dst: &mut BytesMut, name: &str, arguments: &[String], payload: Option<&[u8]>) {
    dst.put_slice(name.as_bytes());
    for argument in arguments {
        dst.put_u8(b' ');
        dst.put_slice(argument.as_bytes());
    }
    if let Some(data) = payload {
        dst.put_u8(b' ');
        dst.put_slice(data.len().to_string().as_bytes());
    }
    dst.put_slice(CRLF);
    if let Some(data) = payload {
        dst.put_slice(data);
        dst.put_slice(CRLF);
    }
}

fn encoded_len(name: &str, arguments: &[String], payload: Option<&[u8]>) -> usize {
    let line = name.len() + arguments.iter().map(|a| a.len() + 1).sum::<usize>() + 2;
    match payload {
        Some(data) => line + 1 + data.len().to_string().len() + data.len() + 2,
        None => line,
    }
}
