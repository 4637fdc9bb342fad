//! Server side of an event stream.
//!
//! [`channel`] splits a stream into a [`SseSender`], which any thread can
//! push formatted events into, and a [`SseStream`], which the connection
//! pulls from as a chunked body. The stream reports `Pending` while the
//! channel is empty and ends once every sender is gone.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::http::request::HeaderSource;
use crate::http::response::{ChunkSource, Response, ResponseBuilder, StatusCode, StreamPoll, StreamWaker};
use crate::sse::codec::SseEvent;
use crate::sse::session::{SessionError, SessionManager};

#[derive(Debug, Default)]
struct Shared {
    waker: Mutex<Option<StreamWaker>>,
}

impl Shared {
    fn wake(&self) {
        let waker = self
            .waker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event stream closed")]
pub struct StreamClosed;

pub fn channel() -> (SseSender, SseStream) {
    let (tx, rx) = mpsc::channel();
    let shared = Arc::new(Shared::default());
    (
        SseSender {
            tx: Some(tx),
            shared: shared.clone(),
        },
        SseStream {
            rx,
            prelude: VecDeque::new(),
            shared,
        },
    )
}

#[derive(Debug)]
pub struct SseSender {
    tx: Option<Sender<Bytes>>,
    shared: Arc<Shared>,
}

impl Clone for SseSender {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl SseSender {
    /// Queues already-formatted bytes.
    pub fn send_raw(&self, bytes: Bytes) -> Result<(), StreamClosed> {
        let tx = self.tx.as_ref().ok_or(StreamClosed)?;
        tx.send(bytes).map_err(|_| StreamClosed)?;
        self.shared.wake();
        Ok(())
    }

    pub fn send(&self, event: &SseEvent) -> Result<(), StreamClosed> {
        self.send_raw(Bytes::from(event.to_wire()))
    }
}

impl Drop for SseSender {
    fn drop(&mut self) {
        // Drop the channel end first so a woken stream observes the disconnect.
        drop(self.tx.take());
        self.shared.wake();
    }
}

#[derive(Debug)]
pub struct SseStream {
    rx: Receiver<Bytes>,
    prelude: VecDeque<Bytes>,
    shared: Arc<Shared>,
}

impl SseStream {
    /// Queues bytes to be sent before anything from the channel.
    pub fn prepend(&mut self, bytes: Bytes) {
        self.prelude.push_back(bytes);
    }
}

impl ChunkSource for SseStream {
    fn poll_chunk(&mut self) -> StreamPoll {
        if let Some(bytes) = self.prelude.pop_front() {
            return StreamPoll::Chunk(bytes);
        }
        match self.rx.try_recv() {
            Ok(bytes) => StreamPoll::Chunk(bytes),
            Err(TryRecvError::Empty) => StreamPoll::Pending,
            Err(TryRecvError::Disconnected) => StreamPoll::End,
        }
    }

    fn attach(&mut self, waker: StreamWaker) {
        *self
            .shared
            .waker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(waker);
    }
}

/// Publishes events on a session-bound stream, recording each one for
/// replay.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: SseSender,
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl EventPublisher {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sends `event`, assigning the next session-scoped id when it has
    /// none. Returns the id used.
    pub fn publish(&self, mut event: SseEvent) -> Result<String, StreamClosed> {
        if event.id.is_empty() {
            event.id = self.sessions.next_event_id(&self.session_id).to_string();
        }
        let formatted = Bytes::from(event.to_wire());
        self.sessions
            .add_event(&self.session_id, &event.id, formatted.clone());
        self.sender.send_raw(formatted)?;
        Ok(event.id)
    }
}

/// Opens a resumable event stream for `request`.
///
/// The session named by `session_header` is reused when valid, otherwise a
/// new one is created. When the request carries `Last-Event-Id`, the
/// events recorded after it are sent first. Session failures come back as
/// ready-made error responses (404 unknown/expired, 400 over capacity).
pub fn open_event_stream<R: HeaderSource>(
    request: &R,
    sessions: &Arc<SessionManager>,
    session_header: &str,
) -> Result<(Response, EventPublisher), Response> {
    let session_id = match request.header_value(session_header) {
        Some(id) => {
            sessions.touch(id).map_err(session_error_response)?;
            id.to_string()
        }
        None => sessions.create_session().map_err(session_error_response)?,
    };

    let (sender, mut stream) = channel();

    if let Some(last_event_id) = request.header_value("Last-Event-Id") {
        let replay = sessions.get_events_since(&session_id, last_event_id.trim());
        tracing::debug!(session = %session_id, replayed = replay.len(), "replaying events");
        for bytes in replay {
            stream.prepend(bytes);
        }
    }

    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header(session_header, session_id.clone())
        .stream(stream)
        .build();

    let publisher = EventPublisher {
        sender,
        sessions: sessions.clone(),
        session_id,
    };
    Ok((response, publisher))
}

pub fn session_error_response(err: SessionError) -> Response {
    let status = match err {
        SessionError::NotFound | SessionError::Expired => StatusCode::NotFound,
        SessionError::CapacityReached => StatusCode::BadRequest,
    };
    ResponseBuilder::new(status)
        .header("Content-Type", "text/plain")
        .body(err.to_string().into_bytes())
        .build()
}
