//! Off-reactor dispatch.
//!
//! Jobs run on the blocking pool of a tokio runtime. A job only computes
//! the response; the reactor thread receives it as a message and is the
//! sole writer of connection state. If the connection went away while the
//! job was queued or running, the job is dropped without a trace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use mio::Token;
use tokio::runtime::Handle;

use crate::http::request::Request;
use crate::server::engine::Engine;
use crate::server::listener::{ReactorMsg, ServerHandle};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Handle,
}

impl WorkerPool {
    /// Uses the blocking pool of the runtime behind `handle`. Its size is
    /// the runtime's `max_blocking_threads`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn from_current() -> anyhow::Result<Self> {
        let handle = Handle::try_current().context("no tokio runtime for worker pool")?;
        Ok(Self::new(handle))
    }

    pub(crate) fn submit(&self, job: Job) {
        tracing::debug!(token = job.token.0, path = %job.request.path, "dispatching to worker pool");
        drop(self.handle.spawn_blocking(move || job.run()));
    }
}

pub(crate) struct Job {
    pub(crate) token: Token,
    pub(crate) request: Request,
    pub(crate) engine: Arc<Engine>,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) reactor: ServerHandle,
}

impl Job {
    fn run(self) {
        if self.cancelled.load(Ordering::Acquire) {
            tracing::debug!(token = self.token.0, "connection closed before dispatch, job abandoned");
            return;
        }

        let response = self.engine.dispatch(&self.request);

        if self.cancelled.load(Ordering::Acquire) {
            tracing::debug!(token = self.token.0, "connection closed during dispatch, response dropped");
            return;
        }

        self.reactor.send(ReactorMsg::Completed {
            token: self.token,
            response,
        });
    }
}
