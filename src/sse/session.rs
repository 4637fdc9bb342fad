//! Session bookkeeping for resumable event streams.
//!
//! Sessions live in memory only. Each keeps a bounded FIFO of the events
//! sent on it so a reconnecting client can ask for everything after its
//! `Last-Event-Id`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::config::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("session limit reached")]
    CapacityReached,
}

#[derive(Debug)]
struct SessionData {
    last_access: Instant,
    history: VecDeque<(String, Bytes)>,
    max_history: usize,
    event_counter: u64,
}

impl SessionData {
    fn new(max_history: usize) -> Self {
        Self {
            last_access: Instant::now(),
            history: VecDeque::new(),
            max_history,
            event_counter: 0,
        }
    }

    fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_access) > timeout
    }
}

/// Owner of every session; all access goes through its methods.
#[derive(Debug)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionData>>,
    timeout: Duration,
    max_sessions: usize,
    max_history: usize,
    resumable: bool,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout: config.timeout(),
            max_sessions: config.max_sessions,
            max_history: config.max_history,
            resumable: config.resumable,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionData>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a session and returns its id.
    ///
    /// At capacity, expired sessions are purged first; creation fails only
    /// if the table is still full afterwards.
    pub fn create_session(&self) -> Result<String, SessionError> {
        let mut sessions = self.lock();

        if sessions.len() >= self.max_sessions {
            let now = Instant::now();
            let before = sessions.len();
            sessions.retain(|_, s| !s.is_expired(self.timeout, now));
            tracing::debug!(purged = before - sessions.len(), "purged expired sessions");

            if sessions.len() >= self.max_sessions {
                tracing::warn!(max = self.max_sessions, "session limit reached");
                return Err(SessionError::CapacityReached);
            }
        }

        let mut id = generate_session_id();
        while sessions.contains_key(&id) {
            id = generate_session_id();
        }
        sessions.insert(id.clone(), SessionData::new(self.max_history));
        tracing::debug!(session = %id, "session created");
        Ok(id)
    }

    /// True if the session exists and has not timed out; refreshes its
    /// last-access time. Expired sessions are evicted.
    pub fn validate_session(&self, id: &str) -> bool {
        self.touch(id).is_ok()
    }

    /// Like [`validate_session`](Self::validate_session) but says why a
    /// session was rejected.
    pub fn touch(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.lock();
        let now = Instant::now();

        let expired = match sessions.get(id) {
            None => return Err(SessionError::NotFound),
            Some(session) => session.is_expired(self.timeout, now),
        };

        if expired {
            sessions.remove(id);
            tracing::debug!(session = %id, "session expired");
            return Err(SessionError::Expired);
        }

        if let Some(session) = sessions.get_mut(id) {
            session.last_access = now;
        }
        Ok(())
    }

    /// Removes a session. Returns false if it did not exist.
    pub fn terminate_session(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            tracing::debug!(session = %id, "session terminated");
        }
        removed
    }

    /// Records a formatted event in the session's replay history.
    ///
    /// No-op when resumability is off or the session is unknown. The
    /// oldest entries are dropped once the history cap is exceeded.
    pub fn add_event(&self, session_id: &str, event_id: &str, formatted: Bytes) {
        if !self.resumable {
            return;
        }
        let mut sessions = self.lock();
        if let Some(session) = sessions.get_mut(session_id) {
            session.history.push_back((event_id.to_string(), formatted));
            while session.history.len() > session.max_history {
                session.history.pop_front();
            }
        }
    }

    /// Next sequential event id for the session, starting at 1. Ids keep
    /// counting across reconnects so replayed and new events never collide.
    pub fn next_event_id(&self, session_id: &str) -> u64 {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.event_counter += 1;
                session.event_counter
            }
            None => 0,
        }
    }

    /// Events recorded after `last_event_id`, oldest first.
    ///
    /// An empty `last_event_id` returns the whole history. An id that is
    /// no longer in the history yields nothing.
    pub fn get_events_since(&self, session_id: &str, last_event_id: &str) -> Vec<Bytes> {
        if !self.resumable {
            return Vec::new();
        }
        let sessions = self.lock();
        let Some(session) = sessions.get(session_id) else {
            return Vec::new();
        };

        if last_event_id.is_empty() {
            return session.history.iter().map(|(_, b)| b.clone()).collect();
        }

        match session.history.iter().position(|(id, _)| id == last_event_id) {
            Some(pos) => session
                .history
                .iter()
                .skip(pos + 1)
                .map(|(_, b)| b.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }
}

/// `<nanos since epoch>-<random>-<random>`, all hex.
fn generate_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{:x}-{:016x}-{:016x}",
        nanos,
        rand::random::<u64>(),
        rand::random::<u64>()
    )
}
