//! Line-oriented, length-prefixed text protocol.
//!
//! - `codec`: frame encoding and command line resolution
//! - `reader`: incremental frame reader shared by client and server
//! - `message`: request and response values
//! - `error`: framing and usage errors

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;

pub use codec::{encode, CommandLine, DataExpectation, CRLF};
pub use error::ProtocolError;
pub use message::{MultiRequest, Request, Response, ResponseBuilder, ERROR_STATUS};
pub use reader::{Frame, FrameReader, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_PAYLOAD};
