//! Consumer for another server's event stream.
//!
//! Connects over plain TCP, sends a `GET` asking for `text/event-stream`,
//! then feeds the response body (chunked or not) through [`SseParser`] and
//! hands each event to a channel. The last seen event id and the session
//! id are remembered so a later [`SseClient::run`] resumes where the
//! previous one stopped.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::http::chunked::ChunkedDecoder;
use crate::http::request::normalize_header_name;
use crate::sse::codec::{SseEvent, SseParser};

const BUFFER_SIZE: usize = 8192;
const MAX_HEAD_SIZE: usize = 64 * 1024;

enum BodyDecoder {
    Identity,
    Chunked(ChunkedDecoder),
}

pub struct SseClient {
    url: url::Url,
    session_header: String,
    connect_timeout: Duration,
    last_event_id: Option<String>,
    session_id: Option<String>,
}

impl SseClient {
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url).context("Invalid stream URL")?;
        if url.scheme() != "http" {
            anyhow::bail!("Unsupported scheme: {}", url.scheme());
        }
        Ok(Self {
            url,
            session_header: "Mcp-Session-Id".to_string(),
            connect_timeout: Duration::from_secs(5),
            last_event_id: None,
            session_id: None,
        })
    }

    pub fn with_session_header(mut self, name: impl Into<String>) -> Self {
        self.session_header = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Request bytes for the next connection attempt.
    pub fn build_request(&self) -> Vec<u8> {
        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }

        let host = match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        };

        let mut buffer = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: text/event-stream\r\nCache-Control: no-cache\r\n",
            target, host
        );
        if let Some(id) = &self.last_event_id {
            buffer.push_str(&format!("Last-Event-Id: {}\r\n", id));
        }
        if let Some(session) = &self.session_id {
            buffer.push_str(&format!("{}: {}\r\n", self.session_header, session));
        }
        buffer.push_str("\r\n");
        buffer.into_bytes()
    }

    /// Streams events into `events` until the server ends the stream or the
    /// receiver is dropped.
    pub async fn run(&mut self, events: mpsc::Sender<SseEvent>) -> Result<()> {
        let host = self.url.host_str().context("Stream URL missing host")?;
        let port = self.url.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port);

        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to event source")?;

        tracing::debug!(%addr, last_event_id = ?self.last_event_id, "connected to event source");

        stream.write_all(&self.build_request()).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let headers = read_head(&mut stream, &mut buffer).await?;

        if let Some(session) = headers.get(&normalize_header_name(&self.session_header)) {
            self.session_id = Some(session.clone());
        }
        if headers
            .get("Content-Type")
            .is_none_or(|ct| !ct.starts_with("text/event-stream"))
        {
            tracing::warn!(content_type = ?headers.get("Content-Type"), "unexpected content type for event stream");
        }

        let mut decoder = match headers.get("Transfer-Encoding") {
            Some(te) if te.to_ascii_lowercase().contains("chunked") => {
                BodyDecoder::Chunked(ChunkedDecoder::new())
            }
            _ => BodyDecoder::Identity,
        };
        let mut parser = SseParser::new();

        loop {
            if !buffer.is_empty() {
                let parsed = match &mut decoder {
                    BodyDecoder::Identity => parser.feed(&buffer),
                    BodyDecoder::Chunked(chunked) => {
                        let mut parsed = Vec::new();
                        for chunk in chunked.feed(&buffer)? {
                            parsed.extend(parser.feed(&chunk));
                        }
                        parsed
                    }
                };
                buffer.clear();

                for event in parsed {
                    if !event.id.is_empty() {
                        self.last_event_id = Some(event.id.clone());
                    }
                    if events.send(event).await.is_err() {
                        tracing::debug!("event receiver dropped, closing stream");
                        return Ok(());
                    }
                }

                if let BodyDecoder::Chunked(chunked) = &decoder {
                    if chunked.is_done() {
                        return Ok(());
                    }
                }
            }

            let n = stream.read_buf(&mut buffer).await?;
            if n == 0 {
                tracing::debug!("event source closed the stream");
                return Ok(());
            }
        }
    }
}

/// Reads and validates the response head, leaving any body bytes that
/// arrived with it in `buffer`.
async fn read_head(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
) -> Result<HashMap<String, String>> {
    loop {
        if let Some(headers_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buffer.split_to(headers_end + 4);
            return parse_response_head(&head);
        }

        // Prevent unbounded header growth
        if buffer.len() > MAX_HEAD_SIZE {
            anyhow::bail!("Response headers too large");
        }

        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            anyhow::bail!("Connection closed before response headers received");
        }
    }
}

/// Parses a response head and requires a 200 status.
pub fn parse_response_head(head: &[u8]) -> Result<HashMap<String, String>> {
    let head = std::str::from_utf8(head).context("Invalid UTF-8 in response headers")?;
    let mut lines = head.lines();

    let status_line = lines.next().context("Empty response")?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        anyhow::bail!("Invalid status line: {}", status_line);
    }
    let status: u16 = parts[1].parse().context("Invalid status code")?;
    if status != 200 {
        anyhow::bail!("Event source responded with status {}", status);
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(normalize_header_name(key.trim()), value.trim().to_string());
        }
    }
    Ok(headers)
}

impl std::fmt::Debug for SseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseClient")
            .field("url", &self.url.as_str())
            .field("last_event_id", &self.last_event_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}
