use crate::config::Limits;
use crate::http::request::{Method, Request, normalize_header_name, split_target};
use crate::http::response::StatusCode;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unknown or oversized method")]
    InvalidMethod,
    #[error("invalid request target")]
    InvalidUri,
    #[error("unsupported protocol version")]
    InvalidVersion,
    #[error("malformed header field")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("query string exceeds limits")]
    InvalidQuery,
    #[error("header block exceeds limit")]
    HeadersTooLarge,
    #[error("incomplete request")]
    Incomplete,
}

impl ParseError {
    /// Status code sent back before the connection is closed.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::HeadersTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Parses a complete request, body included, from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied.
pub fn parse_http_request(buf: &[u8], limits: &Limits) -> Result<(Request, usize), ParseError> {
    let (mut request, head_len) = parse_head(buf, limits)?;

    let content_length = request.content_length();
    let body_bytes = &buf[head_len..];
    if body_bytes.len() < content_length {
        return Err(ParseError::Incomplete);
    }

    request.body = body_bytes[..content_length].to_vec();
    Ok((request, head_len + content_length))
}

/// Parses the request line and header block at the front of `buf`.
///
/// The returned length covers the blank-line terminator; the body, if
/// any, starts right after it.
pub fn parse_head(buf: &[u8], limits: &Limits) -> Result<(Request, usize), ParseError> {
    let (block_end, consumed) = match find_headers_end(buf) {
        Some(found) => found,
        None if buf.len() > limits.max_header_size => return Err(ParseError::HeadersTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    if consumed > limits.max_header_size {
        return Err(ParseError::HeadersTooLarge);
    }

    let headers_str =
        std::str::from_utf8(&buf[..block_end]).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');
    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    if method_str.len() > limits.max_method_length {
        return Err(ParseError::InvalidMethod);
    }
    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    if uri.is_empty() || uri.len() > limits.max_uri_length || uri.bytes().any(is_control) {
        return Err(ParseError::InvalidUri);
    }

    if version.len() > limits.max_protocol_length || !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return Err(ParseError::InvalidVersion);
    }

    let headers = parse_headers(lines, limits)?;

    if let Some(cl) = headers.get("Content-Length") {
        cl.trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
    }

    let (path, query) = split_target(uri);
    let query = match query {
        Some(q) => parse_query(q, limits)?,
        None => Vec::new(),
    };

    let request = Request {
        method,
        path: path.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
        query,
        body: Vec::new(),
        peer: None,
    };

    Ok((request, consumed))
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
    limits: &Limits,
) -> Result<HashMap<String, String>, ParseError> {
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // obsolete line folding
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader);
        }

        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        if name.is_empty()
            || name.len() > limits.max_header_name_length
            || name.bytes().any(|b| is_control(b) || b == b' ' || b == b'\t')
        {
            return Err(ParseError::InvalidHeader);
        }

        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if value.len() > limits.max_header_value_length
            || value.bytes().any(|b| is_control(b) && b != b'\t')
        {
            return Err(ParseError::InvalidHeader);
        }

        headers
            .entry(normalize_header_name(name))
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Ok(headers)
}

fn parse_query(query: &str, limits: &Limits) -> Result<Vec<(String, String)>, ParseError> {
    let mut params = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if params.len() == limits.max_query_params {
            return Err(ParseError::InvalidQuery);
        }
        if key.len() > limits.max_query_key_length || value.len() > limits.max_query_value_length {
            return Err(ParseError::InvalidQuery);
        }
        params.push((key.into_owned(), value.into_owned()));
    }

    Ok(params)
}

/// Locates the blank line ending the header block.
///
/// Returns `(block_end, consumed)`: the header block is `buf[..block_end]`
/// and the terminator ends at `consumed`. Both `\r\n\r\n` and bare `\n\n`
/// are accepted.
pub fn find_headers_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match &buf[i + 1..] {
                [b'\n', ..] => return Some((i, i + 2)),
                [b'\r', b'\n', ..] => return Some((i, i + 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn is_control(b: u8) -> bool {
    b < 0x20 || b == 0x7f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req, &Limits::default()).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn finds_crlf_and_bare_lf_terminators() {
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some((15, 18)));
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\n\nbody"), Some((14, 16)));
        assert_eq!(find_headers_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
