//! Request and response values.
//!
//! Both are immutable once built: the server constructs a [`Request`] after
//! the full payload has arrived, and handlers hand back [`Response`] values
//! built through [`ResponseBuilder`].

use super::codec;
use bytes::{Bytes, BytesMut};

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: String,
    arguments: Vec<String>,
    payload: Option<Bytes>,
}

impl Request {
    /// Create a request with no arguments and no payload.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            arguments: Vec::new(),
            payload: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub(crate) fn from_parts(
        command: String,
        arguments: Vec<String>,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            command,
            arguments,
            payload,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Wire encoding of this request.
    pub fn encode(&self) -> BytesMut {
        codec::encode(&self.command, &self.arguments, self.payload.as_deref())
    }
}

/// A response produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: String,
    arguments: Vec<String>,
    payload: Option<Bytes>,
}

impl Response {
    /// Start building a response with the given status.
    pub fn builder(status: impl Into<String>) -> ResponseBuilder {
        ResponseBuilder {
            status: status.into(),
            arguments: Vec::new(),
            payload: None,
        }
    }

    /// A bare status response such as `STORED` or `END`.
    pub fn status_only(status: impl Into<String>) -> Self {
        Self::builder(status).build()
    }

    /// The standard error response: `ERROR <kind> <len>\r\n<message>\r\n`.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::builder(ERROR_STATUS)
            .arg(kind)
            .payload(Bytes::from(message))
            .build()
    }

    pub(crate) fn from_parts(
        status: String,
        arguments: Vec<String>,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            status,
            arguments,
            payload,
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Whether the status is `ERROR`.
    pub fn is_error(&self) -> bool {
        self.status == ERROR_STATUS
    }

    /// Wire encoding of this response.
    pub fn encode(&self) -> BytesMut {
        codec::encode(&self.status, &self.arguments, self.payload.as_deref())
    }

    pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
        codec::encode_into(dst, &self.status, &self.arguments, self.payload.as_deref());
    }
}

/// Status used by error responses.
pub const ERROR_STATUS: &str = "ERROR";

/// Builder for [`Response`].
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: String,
    arguments: Vec<String>,
    payload: Option<Bytes>,
}

impl ResponseBuilder {
    pub fn arg(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn args<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn build(self) -> Response {
        Response {
            status: self.status,
            arguments: self.arguments,
            payload: self.payload,
        }
    }
}

/// A request answered by a stream of responses.
///
/// Responses are collected until one carries `terminator`. A status that is
/// neither the terminator nor in `expected` ends collection early.
#[derive(Debug, Clone)]
pub struct MultiRequest {
    request: Request,
    expected: Vec<String>,
    terminator: String,
}

impl MultiRequest {
    pub fn new<I, S>(request: Request, expected: I, terminator: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request,
            expected: expected.into_iter().map(Into::into).collect(),
            terminator: terminator.into(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// Whether `status` may appear before the terminator.
    pub fn expects(&self, status: &str) -> bool {
        self.expected.iter().any(|s| s == status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encode() {
        let request = Request::new("SET")
            .args(["key", "0", "0"])
            .with_payload(&b"hello"[..]);
        assert_eq!(&request.encode()[..], b"SET key 0 0 5\r\nhello\r\n");
    }

    #[test]
    fn test_response_builder() {
        let response = Response::builder("VALUE")
            .arg("foo")
            .arg("0")
            .payload(&b"bar"[..])
            .build();
        assert_eq!(response.status(), "VALUE");
        assert_eq!(response.arguments(), ["foo", "0"]);
        assert_eq!(response.payload().map(|p| &p[..]), Some(&b"bar"[..]));
        assert_eq!(&response.encode()[..], b"VALUE foo 0 3\r\nbar\r\n");
    }

    #[test]
    fn test_error_response() {
        let response = Response::error("ParseIntError", "invalid digit found in string");
        assert!(response.is_error());
        assert_eq!(
            &response.encode()[..],
            b"ERROR ParseIntError 29\r\ninvalid digit found in string\r\n"
        );
    }

    #[test]
    fn test_multi_request_expectations() {
        let multi = MultiRequest::new(Request::new("GETS").arg("a"), ["VALUE"], "END");
        assert!(multi.expects("VALUE"));
        assert!(!multi.expects("END"));
        assert_eq!(multi.terminator(), "END");
    }
}
