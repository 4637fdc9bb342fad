use bytes::{Buf, BufMut, BytesMut};
use std::io::{self, Write};

use crate::http::chunked::{TERMINAL_CHUNK, encode_chunk};
use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Writes the status line, headers and blank line of `resp` into `out`.
///
/// Headers go out in name order so the wire image is stable.
pub fn serialize_head(resp: &Response, out: &mut BytesMut) {
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    out.put_slice(status_line.as_bytes());

    let mut headers: Vec<_> = resp.headers.iter().collect();
    headers.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in headers {
        out.put_slice(k.as_bytes());
        out.put_slice(b": ");
        out.put_slice(v.as_bytes());
        out.put_slice(b"\r\n");
    }

    // Header/body separator
    out.put_slice(b"\r\n");
}

/// Serializes a fixed-body response in one piece.
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256 + resp.body.len());
    serialize_head(resp, &mut buf);
    buf.put_slice(&resp.body);
    buf.to_vec()
}

/// Bytes waiting for the socket.
///
/// Only unsent bytes are retained: every successful write advances past
/// the sent prefix without shifting the remainder.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    buffer: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn push_head(&mut self, resp: &Response) {
        serialize_head(resp, &mut self.buffer);
    }

    pub fn push_chunk(&mut self, data: &[u8]) {
        encode_chunk(data, &mut self.buffer);
    }

    pub fn push_terminal_chunk(&mut self) {
        self.buffer.put_slice(TERMINAL_CHUNK);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Writes as much as the stream accepts without blocking.
    ///
    /// Returns `Ok(true)` once everything has been written and
    /// `Ok(false)` when the stream would block with bytes still pending.
    pub fn write_to_stream<W: Write>(&mut self, stream: &mut W) -> io::Result<bool> {
        while !self.buffer.is_empty() {
            match stream.write(&self.buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ));
                }
                Ok(n) => self.buffer.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }
}
