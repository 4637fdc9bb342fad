use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// HTTP status codes.
///
/// The engine itself only produces 100, 204, 400, 404, 405, 413, 417 and
/// 431; the rest are available to handlers. `Other` carries any code not
/// listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 100 Continue
    Continue,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 202 Accepted
    Accepted,
    /// 204 No Content
    NoContent,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 417 Expectation Failed
    ExpectationFailed,
    /// 431 Request Header Fields Too Large
    RequestHeaderFieldsTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// Any other code
    Other(u16),
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use beacon::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::RequestHeaderFieldsTooLarge.as_u16(), 431);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue => 100,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::Accepted => 202,
            StatusCode::NoContent => 204,
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::ExpectationFailed => 417,
            StatusCode::RequestHeaderFieldsTooLarge => 431,
            StatusCode::InternalServerError => 500,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Other(code) => *code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            100 => StatusCode::Continue,
            200 => StatusCode::Ok,
            201 => StatusCode::Created,
            202 => StatusCode::Accepted,
            204 => StatusCode::NoContent,
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            403 => StatusCode::Forbidden,
            404 => StatusCode::NotFound,
            405 => StatusCode::MethodNotAllowed,
            413 => StatusCode::PayloadTooLarge,
            417 => StatusCode::ExpectationFailed,
            431 => StatusCode::RequestHeaderFieldsTooLarge,
            500 => StatusCode::InternalServerError,
            503 => StatusCode::ServiceUnavailable,
            other => StatusCode::Other(other),
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Continue => "Continue",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::Accepted => "Accepted",
            StatusCode::NoContent => "No Content",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::ExpectationFailed => "Expectation Failed",
            StatusCode::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::ServiceUnavailable => "Service Unavailable",
            StatusCode::Other(_) => "Unknown",
        }
    }

    /// Statuses that never carry a body.
    pub fn is_bodyless(&self) -> bool {
        let code = self.as_u16();
        (100..200).contains(&code) || code == 204 || code == 304
    }
}

/// Result of pulling from a streaming body.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamPoll {
    /// Next chunk to send. An empty chunk ends the stream.
    Chunk(Bytes),
    /// Nothing available yet; the source will wake the connection.
    Pending,
    /// No more data.
    End,
}

/// Wakes a parked streaming connection so the engine pulls again.
#[derive(Clone)]
pub struct StreamWaker {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl StreamWaker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self { wake: Arc::new(wake) }
    }

    pub fn wake(&self) {
        (self.wake)()
    }
}

impl fmt::Debug for StreamWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamWaker")
    }
}

/// Pull-style source for a chunked response body.
pub trait ChunkSource: Send {
    fn poll_chunk(&mut self) -> StreamPoll;

    /// Called once by the engine before the first poll. Sources that can
    /// return `Pending` keep the waker and call it when data arrives.
    fn attach(&mut self, _waker: StreamWaker) {}
}

/// Plain pull functions: `None` ends the stream.
impl<F> ChunkSource for F
where
    F: FnMut() -> Option<Bytes> + Send,
{
    fn poll_chunk(&mut self) -> StreamPoll {
        match self() {
            Some(chunk) => StreamPoll::Chunk(chunk),
            None => StreamPoll::End,
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// An HTTP response ready to be serialized.
///
/// A response either carries a fixed `body`, or a `stream` that is sent
/// with chunked transfer encoding.
pub struct Response {
    /// The HTTP status code
    pub status: StatusCode,
    /// HTTP headers as key-value pairs
    pub headers: HashMap<String, String>,
    /// Response body as bytes
    pub body: Vec<u8>,
    /// Streaming body, pulled one chunk per write opportunity
    pub stream: Option<Box<dyn ChunkSource>>,
    /// Invoked after the terminating chunk has been queued
    pub on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```
/// # use beacon::http::response::{ResponseBuilder, StatusCode};
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// assert_eq!(response.headers["Content-Length"], "2");
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    stream: Option<Box<dyn ChunkSource>>,
    on_complete: Option<CompletionCallback>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
            stream: None,
            on_complete: None,
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Sends the body as a chunked stream pulled from `source`.
    pub fn stream(mut self, source: impl ChunkSource + 'static) -> Self {
        self.stream = Some(Box::new(source));
        self
    }

    /// Runs `callback` once the stream has ended.
    ///
    /// It runs after the terminating chunk is queued, or right away when a
    /// HEAD request means no body is sent. It does not run when the
    /// connection is torn down mid-stream by a peer close or shutdown;
    /// use the source's own `Drop` to observe that.
    pub fn on_complete(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Builds the final Response.
    ///
    /// Adds a Content-Length header for fixed bodies unless one is already
    /// present; streaming responses are framed by the engine instead.
    pub fn build(mut self) -> Response {
        if self.stream.is_none() {
            self.headers
                .entry("Content-Length".to_string())
                .or_insert_with(|| self.body.len().to_string());
        }

        Response {
            status: self.status,
            headers: self.headers,
            body: self.body,
            stream: self.stream,
            on_complete: self.on_complete,
        }
    }
}

impl Response {
    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        ResponseBuilder::new(StatusCode::Ok)
            .body(body.into())
            .build()
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        ResponseBuilder::new(StatusCode::NotFound)
            .body(b"404 Not Found".to_vec())
            .build()
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error() -> Self {
        ResponseBuilder::new(StatusCode::InternalServerError)
            .body(b"500 Internal Server Error".to_vec())
            .build()
    }

    /// A plain-text response whose body is the status line, e.g. `400 Bad Request`.
    pub fn error(status: StatusCode) -> Self {
        let body = format!("{} {}", status.as_u16(), status.reason_phrase());
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain")
            .body(body.into_bytes())
            .build()
    }

    /// Empty 200 response streamed from `source`.
    pub fn streaming(source: impl ChunkSource + 'static) -> Self {
        ResponseBuilder::new(StatusCode::Ok).stream(source).build()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }
}
