use std::collections::HashMap;
use std::net::SocketAddr;

/// HTTP request methods accepted by the parser.
///
/// Anything outside this whitelist is rejected with 400 before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource (or terminate a session)
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - CORS preflight
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from its wire token.
    ///
    /// # Example
    ///
    /// ```
    /// # use beacon::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

/// Read-only header access.
///
/// Anything that needs to inspect request headers (session lookup,
/// authentication checks) goes through this trait rather than the
/// concrete request type.
pub trait HeaderSource {
    fn header_value(&self, name: &str) -> Option<&str>;

    fn has_header(&self, name: &str) -> bool {
        self.header_value(name).is_some()
    }
}

/// A parsed HTTP request.
///
/// Header names are stored Title-Cased (`content-length` becomes
/// `Content-Length`) so lookups are insensitive to the client's casing.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Path component of the request target, without the query string
    pub path: String,
    /// Full request target as received
    pub uri: String,
    /// Protocol token (`HTTP/1.0` or `HTTP/1.1`)
    pub version: String,
    /// Request headers keyed by Title-Case name
    pub headers: HashMap<String, String>,
    /// Decoded query parameters in arrival order
    pub query: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
    /// Address of the peer, when known
    pub peer: Option<SocketAddr>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(normalize_header_name(key), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let uri = self.uri.ok_or("uri missing")?;
        let (path, query) = split_target(&uri);
        let query = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Request {
            method: self.method.ok_or("method missing")?,
            path: path.to_string(),
            uri,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            query,
            body: self.body,
            peer: None,
        })
    }
}

impl Request {
    /// Retrieves a header value by name, in any casing.
    pub fn header(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(v) => Some(v.as_str()),
            None => self
                .headers
                .get(&normalize_header_name(key))
                .map(|v| v.as_str()),
        }
    }

    /// Content-Length header parsed as a usize; 0 if missing or invalid.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the connection should stay open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; an explicit
    /// `Connection: close` or `Connection: keep-alive` overrides either.
    pub fn keep_alive(&self) -> bool {
        let default = self.version == "HTTP/1.1";
        match self.header("Connection") {
            Some(v) => {
                let tokens = || v.split(',').map(str::trim);
                if tokens().any(|t| t.eq_ignore_ascii_case("close")) {
                    false
                } else if tokens().any(|t| t.eq_ignore_ascii_case("keep-alive")) {
                    true
                } else {
                    default
                }
            }
            None => default,
        }
    }

    /// First value of a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for Request {
    fn header_value(&self, name: &str) -> Option<&str> {
        self.header(name)
    }
}

/// Title-Cases a header name: `x-request-id` -> `X-Request-Id`.
pub fn normalize_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Splits a request target into path and optional query string.
pub(crate) fn split_target(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    }
}
