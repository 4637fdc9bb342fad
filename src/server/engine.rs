//! Shared, read-only server state: configuration, routes, sessions and the
//! optional worker pool. Every connection holds a reference to one engine.

use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{Config, Limits};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::server::router::Router;
use crate::server::worker::WorkerPool;
use crate::sse::session::SessionManager;

pub struct Engine {
    config: Config,
    router: Router,
    sessions: Arc<SessionManager>,
    pool: Option<WorkerPool>,
}

impl Engine {
    pub fn new(config: Config, router: Router) -> Self {
        let sessions = Arc::new(SessionManager::new(&config.sessions));
        Self {
            config,
            router,
            sessions,
            pool: None,
        }
    }

    /// Shares an existing session table, typically one that handlers
    /// also hold.
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limits(&self) -> &Limits {
        &self.config.limits
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn worker_pool(&self) -> Option<&WorkerPool> {
        self.pool.as_ref()
    }

    /// Produces the response for a fully received request.
    ///
    /// OPTIONS and session-terminating DELETEs are answered here; every
    /// other request goes to the first matching route, or 404.
    pub fn dispatch(&self, request: &Request) -> Response {
        match request.method {
            Method::OPTIONS => {
                return if self.config.cors.enabled {
                    ResponseBuilder::new(StatusCode::NoContent).build()
                } else {
                    Response::error(StatusCode::MethodNotAllowed)
                };
            }
            Method::DELETE => {
                if let Some(id) = request.header(&self.config.sessions.header_name) {
                    return if self.sessions.terminate_session(id) {
                        Response::ok("session terminated")
                    } else {
                        Response::error(StatusCode::NotFound)
                    };
                }
            }
            _ => {}
        }

        match self.router.find(&request.uri) {
            Some(handler) => handler.handle(request),
            None => Response::not_found(),
        }
    }

    /// Adds the engine-owned headers and fixes up body framing.
    pub fn finalize_headers(&self, resp: &mut Response, keep_alive: bool, host: Option<&str>) {
        let connection = if keep_alive { "keep-alive" } else { "close" };
        resp.headers
            .insert("Connection".to_string(), connection.to_string());
        resp.headers.insert(
            "Date".to_string(),
            httpdate::fmt_http_date(SystemTime::now()),
        );
        if let Some(host) = host {
            resp.headers
                .entry("Host".to_string())
                .or_insert_with(|| host.to_string());
        }

        let cors = &self.config.cors;
        if cors.enabled {
            for (name, value) in [
                ("Access-Control-Allow-Origin", cors.allow_origin.clone()),
                ("Access-Control-Allow-Methods", cors.allow_methods.clone()),
                ("Access-Control-Allow-Headers", cors.allow_headers.clone()),
                ("Access-Control-Expose-Headers", cors.expose_headers.clone()),
                ("Access-Control-Max-Age", cors.max_age.to_string()),
            ] {
                resp.headers.insert(name.to_string(), value);
            }
        }

        if resp.stream.is_some() {
            resp.headers.remove("Content-Length");
            resp.headers
                .insert("Transfer-Encoding".to_string(), "chunked".to_string());
        } else if resp.status.is_bodyless() {
            resp.headers.remove("Content-Length");
            resp.body.clear();
        } else {
            resp.headers
                .insert("Content-Length".to_string(), resp.body.len().to_string());
        }
    }
}
