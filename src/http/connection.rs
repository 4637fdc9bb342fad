use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::Token;

use crate::http::parser::{ParseError, parse_head};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode, StreamPoll};
use crate::http::writer::{CONTINUE_RESPONSE, ResponseWriter};
use crate::server::engine::Engine;
use crate::server::listener::ServerHandle;
use crate::server::worker::Job;

const READ_CHUNK: usize = 4096;

/// A byte stream the state machine can drive.
pub trait Transport: Read + Write {
    /// Half-closes the connection: no more bytes will be sent.
    fn shutdown_write(&mut self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ReceivingHeaders,
    Sending100Continue,
    ReceivingBody,
    Processing,
    ProcessingAsync,
    SendingHeaders,
    SendingBody,
    StreamingChunked,
    Closing,
}

/// What the connection wants from the reactor next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
    Close,
}

/// Everything a connection can reach while it runs.
pub struct Context<'a> {
    pub engine: &'a Arc<Engine>,
    pub token: Token,
    pub reactor: Option<&'a ServerHandle>,
}

impl<'a> Context<'a> {
    /// A context with no reactor: dispatch always runs inline and
    /// streams are never woken.
    pub fn inline(engine: &'a Arc<Engine>) -> Self {
        Self {
            engine,
            token: Token(0),
            reactor: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Wait,
}

/// Per-socket request/response state machine.
///
/// The connection never blocks: every step either makes progress with the
/// bytes at hand or returns, to be re-entered on the next readiness event.
pub struct Connection<S> {
    stream: S,
    peer: Option<SocketAddr>,
    recv: BytesMut,
    writer: ResponseWriter,
    state: ConnectionState,
    request: Option<Request>,
    response: Option<Response>,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    protocol_error: bool,
    head_only: bool,
    body_queued: bool,
    stream_parked: bool,
    chunks_sent: u64,
    read_closed: bool,
    cancelled: Option<Arc<AtomicBool>>,
    last_activity: Instant,
}

impl<S: Transport> Connection<S> {
    pub fn new(stream: S, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            peer,
            recv: BytesMut::with_capacity(READ_CHUNK),
            writer: ResponseWriter::new(),
            state: ConnectionState::Idle,
            request: None,
            response: None,
            host: None,
            content_length: 0,
            keep_alive: false,
            protocol_error: false,
            head_only: false,
            body_queued: false,
            stream_parked: false,
            chunks_sent: 0,
            read_closed: false,
            cancelled: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Chunks written for the current streaming response.
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    /// Unconsumed bytes in the receive buffer.
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    pub fn interest(&self) -> Interest {
        match self.state {
            ConnectionState::Closing => Interest::Close,
            _ if !self.writer.is_empty() => Interest::ReadWrite,
            ConnectionState::StreamingChunked if self.stream_parked => Interest::Read,
            ConnectionState::Sending100Continue
            | ConnectionState::SendingHeaders
            | ConnectionState::SendingBody
            | ConnectionState::StreamingChunked => Interest::ReadWrite,
            _ => Interest::Read,
        }
    }

    /// True when the connection has been waiting for request bytes for
    /// longer than `timeout`.
    pub fn is_idle_expired(&self, now: Instant, timeout: Duration) -> bool {
        matches!(
            self.state,
            ConnectionState::Idle
                | ConnectionState::ReceivingHeaders
                | ConnectionState::ReceivingBody
        ) && now.duration_since(self.last_activity) > timeout
    }

    /// Marks the connection dead so a queued worker job is abandoned.
    ///
    /// A streaming body still in progress is dropped without running its
    /// completion callback.
    pub fn abort(&mut self) {
        if let Some(cancelled) = self.cancelled.take() {
            cancelled.store(true, Ordering::Release);
        }
        self.state = ConnectionState::Closing;
    }

    pub fn on_readable(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        let limits = ctx.engine.limits();
        let max_buffered = limits.max_header_size + limits.max_body_size + READ_CHUNK;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.read_closed = true;
                    break;
                }
                Ok(n) => {
                    self.recv.extend_from_slice(&buf[..n]);
                    self.last_activity = Instant::now();
                    if self.recv.len() > max_buffered {
                        tracing::warn!(token = ctx.token.0, buffered = self.recv.len(), "receive buffer overflow, closing");
                        self.abort();
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        // A half-closed peer still gets the answer to a request it sent in
        // full; finish_cycle closes afterwards. An open-ended stream has no
        // reader left, so it is torn down.
        if self.read_closed && self.state == ConnectionState::StreamingChunked {
            tracing::debug!(token = ctx.token.0, chunks = self.chunks_sent, "peer closed mid-stream");
            self.abort();
            return Ok(());
        }

        self.advance(ctx)
    }

    pub fn on_writable(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        self.advance(ctx)
    }

    /// Delivers a response computed on a worker thread. Ignored unless the
    /// connection is still waiting for it.
    pub fn resume(&mut self, ctx: &Context<'_>, response: Response) -> io::Result<()> {
        if self.state != ConnectionState::ProcessingAsync {
            tracing::debug!(token = ctx.token.0, state = ?self.state, "stale worker response dropped");
            return Ok(());
        }
        self.cancelled = None;
        self.begin_response(ctx, response);
        self.advance(ctx)
    }

    /// Pulls again from a streaming body that reported `Pending`.
    pub fn wake_stream(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        if self.state != ConnectionState::StreamingChunked {
            return Ok(());
        }
        self.stream_parked = false;
        self.advance(ctx)
    }

    /// Runs the state machine until it needs more input, more output
    /// space, or an external event.
    pub fn advance(&mut self, ctx: &Context<'_>) -> io::Result<()> {
        loop {
            let flow = match self.state {
                ConnectionState::Idle => self.start_request(),
                ConnectionState::ReceivingHeaders => self.receive_headers(ctx),
                ConnectionState::Sending100Continue => self.send_continue()?,
                ConnectionState::ReceivingBody => self.receive_body(),
                ConnectionState::Processing => self.process(ctx),
                ConnectionState::ProcessingAsync => Flow::Wait,
                ConnectionState::SendingHeaders => self.send_headers(ctx)?,
                ConnectionState::SendingBody => self.send_body()?,
                ConnectionState::StreamingChunked => self.stream_chunk()?,
                ConnectionState::Closing => Flow::Wait,
            };
            if flow == Flow::Wait {
                return Ok(());
            }
        }
    }

    fn start_request(&mut self) -> Flow {
        // Stray line breaks between keep-alive requests are skipped.
        let blank = self
            .recv
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        self.recv.advance(blank);

        if self.recv.is_empty() {
            if self.read_closed {
                self.state = ConnectionState::Closing;
            }
            return Flow::Wait;
        }

        self.state = ConnectionState::ReceivingHeaders;
        Flow::Continue
    }

    fn receive_headers(&mut self, ctx: &Context<'_>) -> Flow {
        let limits = ctx.engine.limits();
        let mut request = match parse_head(&self.recv, limits) {
            Ok((request, consumed)) => {
                self.recv.advance(consumed);
                request
            }
            Err(ParseError::Incomplete) => {
                if self.read_closed {
                    self.state = ConnectionState::Closing;
                }
                return Flow::Wait;
            }
            Err(e) => {
                tracing::warn!(token = ctx.token.0, peer = ?self.peer, error = %e, "rejecting request");
                self.fail(e.status());
                return Flow::Continue;
            }
        };

        request.peer = self.peer;
        self.keep_alive = request.keep_alive();
        self.content_length = request.content_length();
        self.host = request.header("Host").map(str::to_string);

        tracing::debug!(
            token = ctx.token.0,
            method = request.method.as_str(),
            path = %request.path,
            content_length = self.content_length,
            keep_alive = self.keep_alive,
            "request head parsed"
        );

        if self.content_length > limits.max_body_size {
            tracing::warn!(token = ctx.token.0, content_length = self.content_length, "body too large");
            self.fail(StatusCode::PayloadTooLarge);
            return Flow::Continue;
        }

        if request.version == "HTTP/1.1" {
            if let Some(expect) = request.header("Expect") {
                if !expect.trim().eq_ignore_ascii_case("100-continue") {
                    tracing::warn!(token = ctx.token.0, expect, "unsupported expectation");
                    self.fail(StatusCode::ExpectationFailed);
                    return Flow::Continue;
                }
                self.request = Some(request);
                self.writer.push(CONTINUE_RESPONSE);
                self.state = ConnectionState::Sending100Continue;
                return Flow::Continue;
            }
        }

        self.request = Some(request);
        self.state = ConnectionState::ReceivingBody;
        Flow::Continue
    }

    fn send_continue(&mut self) -> io::Result<Flow> {
        if !self.writer.write_to_stream(&mut self.stream)? {
            return Ok(Flow::Wait);
        }
        self.state = ConnectionState::ReceivingBody;
        Ok(Flow::Continue)
    }

    fn receive_body(&mut self) -> Flow {
        if self.recv.len() < self.content_length {
            if self.read_closed {
                self.state = ConnectionState::Closing;
            }
            return Flow::Wait;
        }

        let body = self.recv.split_to(self.content_length);
        if let Some(request) = self.request.as_mut() {
            request.body = body.to_vec();
        }
        self.state = ConnectionState::Processing;
        Flow::Continue
    }

    fn process(&mut self, ctx: &Context<'_>) -> Flow {
        // A protocol error already produced its response.
        if let Some(response) = self.response.take() {
            self.begin_response(ctx, response);
            return Flow::Continue;
        }

        let Some(mut request) = self.request.take() else {
            self.state = ConnectionState::Closing;
            return Flow::Continue;
        };

        if request.method == Method::HEAD {
            self.head_only = true;
            request.method = Method::GET;
        }

        if let (Some(pool), Some(reactor)) = (ctx.engine.worker_pool(), ctx.reactor) {
            let cancelled = Arc::new(AtomicBool::new(false));
            self.cancelled = Some(cancelled.clone());
            pool.submit(Job {
                token: ctx.token,
                request,
                engine: ctx.engine.clone(),
                cancelled,
                reactor: reactor.clone(),
            });
            self.state = ConnectionState::ProcessingAsync;
            return Flow::Wait;
        }

        let response = ctx.engine.dispatch(&request);
        self.begin_response(ctx, response);
        Flow::Continue
    }

    fn begin_response(&mut self, ctx: &Context<'_>, mut response: Response) {
        ctx.engine
            .finalize_headers(&mut response, self.keep_alive, self.host.as_deref());

        if self.head_only {
            response.body.clear();
            if response.stream.take().is_some() {
                if let Some(on_complete) = response.on_complete.take() {
                    on_complete();
                }
            }
        }

        tracing::debug!(
            token = ctx.token.0,
            status = response.status.as_u16(),
            streaming = response.is_streaming(),
            "sending response"
        );

        self.writer.push_head(&response);
        self.response = Some(response);
        self.body_queued = false;
        self.state = ConnectionState::SendingHeaders;
    }

    fn send_headers(&mut self, ctx: &Context<'_>) -> io::Result<Flow> {
        if !self.writer.write_to_stream(&mut self.stream)? {
            return Ok(Flow::Wait);
        }

        let source = self.response.as_mut().and_then(|r| r.stream.as_mut());
        match source {
            Some(source) => {
                if let Some(reactor) = ctx.reactor {
                    source.attach(reactor.stream_waker(ctx.token));
                }
                self.chunks_sent = 0;
                self.stream_parked = false;
                self.state = ConnectionState::StreamingChunked;
            }
            None => self.state = ConnectionState::SendingBody,
        }
        Ok(Flow::Continue)
    }

    fn send_body(&mut self) -> io::Result<Flow> {
        if !self.body_queued {
            if let Some(response) = self.response.as_mut() {
                let body = std::mem::take(&mut response.body);
                self.writer.push(&body);
            }
            self.body_queued = true;
        }

        if !self.writer.write_to_stream(&mut self.stream)? {
            return Ok(Flow::Wait);
        }

        self.finish_cycle();
        Ok(Flow::Continue)
    }

    /// Pulls at most one chunk per write opportunity.
    fn stream_chunk(&mut self) -> io::Result<Flow> {
        if !self.writer.write_to_stream(&mut self.stream)? {
            return Ok(Flow::Wait);
        }

        let Some(response) = self.response.as_mut() else {
            self.state = ConnectionState::SendingBody;
            return Ok(Flow::Continue);
        };
        let Some(source) = response.stream.as_mut() else {
            self.state = ConnectionState::SendingBody;
            return Ok(Flow::Continue);
        };

        match source.poll_chunk() {
            StreamPoll::Chunk(chunk) if !chunk.is_empty() => {
                self.writer.push_chunk(&chunk);
                self.chunks_sent += 1;
                self.writer.write_to_stream(&mut self.stream)?;
                Ok(Flow::Wait)
            }
            StreamPoll::Pending => {
                self.stream_parked = true;
                Ok(Flow::Wait)
            }
            StreamPoll::Chunk(_) | StreamPoll::End => {
                response.stream = None;
                self.writer.push_terminal_chunk();
                if let Some(on_complete) = response.on_complete.take() {
                    on_complete();
                }
                tracing::debug!(chunks = self.chunks_sent, "stream finished");
                self.body_queued = true;
                self.state = ConnectionState::SendingBody;
                Ok(Flow::Continue)
            }
        }
    }

    /// Queues a fixed error response and forces the connection closed
    /// after it is sent.
    fn fail(&mut self, status: StatusCode) {
        self.request = None;
        self.response = Some(Response::error(status));
        self.keep_alive = false;
        self.protocol_error = true;
        self.recv.clear();
        self.state = ConnectionState::Processing;
    }

    fn finish_cycle(&mut self) {
        self.request = None;
        self.response = None;
        self.host = None;
        self.content_length = 0;
        self.head_only = false;
        self.body_queued = false;
        self.stream_parked = false;
        self.cancelled = None;

        if self.keep_alive && !self.protocol_error && !self.read_closed {
            self.state = ConnectionState::Idle;
            return;
        }

        if let Err(e) = self.stream.shutdown_write() {
            tracing::debug!(error = %e, "shutdown after response failed");
        }
        self.state = ConnectionState::Closing;
    }
}
