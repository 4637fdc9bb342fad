//! Handler registry.
//!
//! Routes are matched by prefix in registration order: the first handler
//! whose path is a prefix of the request target wins.

use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::Response;

/// Application code invoked for a matched request.
///
/// Handlers may run on the reactor thread or on a worker thread, so they
/// must be `Send + Sync`. A handler that blocks should only be used with a
/// worker pool configured.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<(String, Arc<dyn Handler>)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, prefix: impl Into<String>, handler: impl Handler) -> Self {
        self.routes.push((prefix.into(), Arc::new(handler)));
        self
    }

    pub fn find(&self, target: &str) -> Option<&Arc<dyn Handler>> {
        self.routes
            .iter()
            .find(|(prefix, _)| target.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|(prefix, _)| prefix))
            .finish()
    }
}
