//! Protocol error taxonomy.
//!
//! Framing errors are fatal to the connection that produced them. Usage
//! errors (`InvalidCommand`, `EmptyCommand`) are reported back to the peer
//! as an `ERROR` response and the connection keeps serving.

use thiserror::Error;

/// Errors raised while decoding a frame or resolving a command line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A `\r` was followed by something other than `\n`.
    #[error("incomplete command terminator")]
    IncompleteCommandTerminator,

    /// The payload was not followed by the mandatory `\r\n` trailer.
    #[error("data terminator missing")]
    DataTerminatorMissing,

    /// More payload bytes arrived than the command line declared.
    #[error("payload exceeds declared length of {declared} bytes")]
    PayloadOverrun { declared: usize },

    /// The accumulated payload does not match the declared length.
    #[error("payload length mismatch: declared {declared}, received {received}")]
    PayloadLengthMismatch { declared: usize, received: usize },

    /// The declared payload length exceeds the reader's limit.
    #[error("declared payload of {declared} bytes exceeds limit of {limit}")]
    PayloadTooLarge { declared: usize, limit: usize },

    /// The command line is malformed for its data expectation.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The command line carried no tokens.
    #[error("empty command")]
    EmptyCommand,

    /// The command line is not valid UTF-8.
    #[error("command line is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Whether this error desynchronises the stream and must close the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::InvalidCommand(_) | ProtocolError::EmptyCommand
        )
    }

    /// Short name used as the argument of an `ERROR` response.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::IncompleteCommandTerminator => "IncompleteCommandTerminator",
            ProtocolError::DataTerminatorMissing => "DataTerminatorMissing",
            ProtocolError::PayloadOverrun { .. } => "PayloadOverrun",
            ProtocolError::PayloadLengthMismatch { .. } => "PayloadLengthMismatch",
            ProtocolError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ProtocolError::InvalidCommand(_) => "InvalidCommand",
            ProtocolError::EmptyCommand => "EmptyCommand",
            ProtocolError::InvalidUtf8 => "InvalidUtf8",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::DataTerminatorMissing.is_fatal());
        assert!(ProtocolError::IncompleteCommandTerminator.is_fatal());
        assert!(ProtocolError::PayloadOverrun { declared: 3 }.is_fatal());
        assert!(ProtocolError::PayloadTooLarge {
            declared: 10,
            limit: 5
        }
        .is_fatal());
        assert!(!ProtocolError::InvalidCommand("SET".to_string()).is_fatal());
        assert!(!ProtocolError::EmptyCommand.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::PayloadLengthMismatch {
            declared: 5,
            received: 3,
        };
        assert_eq!(
            err.to_string(),
            "payload length mismatch: declared 5, received 3"
        );
        assert_eq!(err.kind(), "PayloadLengthMismatch");
    }
}
