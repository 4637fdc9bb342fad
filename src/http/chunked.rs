//! Chunked transfer encoding.
//!
//! Each chunk is framed as `<hex-size>\r\n<bytes>\r\n`; the body ends with
//! the zero-size chunk `0\r\n\r\n`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Largest chunk the decoder accepts.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Appends one framed chunk to `out`. Empty input is a no-op; the
/// terminator is written separately with [`TERMINAL_CHUNK`].
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.reserve(data.len() + 12);
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkedError {
    #[error("invalid chunk size line")]
    InvalidSize,
    #[error("chunk data not followed by CRLF")]
    MissingCrlf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Size,
    Data(usize),
    Trailers,
    Done,
}

/// Incremental decoder for a chunked body.
///
/// Input may be split anywhere; a chunk is only emitted once it has
/// arrived in full, so the output sequence matches what the sender framed.
#[derive(Debug)]
pub struct ChunkedDecoder {
    buf: BytesMut,
    state: DecodeState,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::Size,
        }
    }

    /// Feeds more encoded bytes and returns every chunk completed by them.
    pub fn feed(&mut self, input: &[u8]) -> Result<Vec<Bytes>, ChunkedError> {
        self.buf.extend_from_slice(input);
        let mut chunks = Vec::new();

        loop {
            match self.state {
                DecodeState::Size => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    let line = self.buf.split_to(pos + 2);
                    let size = parse_size(&line[..pos])?;
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::Data(size)
                    };
                }
                DecodeState::Data(size) => {
                    let framed = size.checked_add(2).ok_or(ChunkedError::InvalidSize)?;
                    if self.buf.len() < framed {
                        break;
                    }
                    let data = self.buf.split_to(size).freeze();
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ChunkedError::MissingCrlf);
                    }
                    self.buf.advance(2);
                    chunks.push(data);
                    self.state = DecodeState::Size;
                }
                DecodeState::Trailers => {
                    let Some(pos) = find_crlf(&self.buf) else { break };
                    self.buf.advance(pos + 2);
                    if pos == 0 {
                        self.state = DecodeState::Done;
                    }
                }
                DecodeState::Done => break,
            }
        }

        Ok(chunks)
    }

    /// True once the terminating chunk and trailer section have been read.
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Bytes received after the end of the body.
    pub fn remaining(&self) -> &[u8] {
        if self.is_done() { &self.buf } else { &[] }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let line = std::str::from_utf8(line).map_err(|_| ChunkedError::InvalidSize)?;
    // chunk extensions are ignored
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(ChunkedError::InvalidSize);
    }
    match usize::from_str_radix(size, 16) {
        Ok(size) if size <= MAX_CHUNK_SIZE => Ok(size),
        _ => Err(ChunkedError::InvalidSize),
    }
}
