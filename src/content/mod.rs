//! Content handlers.
//!
//! A [`Router`] maps a request target to the [`Handler`] that produces its output. Main
//! requests and subrequests are routed alike.
use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;

use crate::error::Error;
use crate::request::Request;
use crate::response::StatusCode;

mod file;
mod include;
mod text;

pub use file::Static;
pub use include::Include;
pub use text::{NotFound, Text};

/// Produces the output of one request.
///
/// Called again whenever the request is posted, until it returns `Ready`. A handler that
/// returns `Pending` must have arranged to be posted, through a [`Waker`][crate::Waker],
/// a subrequest, or blocked output.
pub trait Handler: Send {
    /// Returns the final status once all output is submitted.
    fn handle(&mut self, req: &mut Request<'_>) -> Poll<Result<StatusCode, Error>>;
}

impl<F> Handler for F
where
    F: FnMut(&mut Request<'_>) -> Poll<Result<StatusCode, Error>> + Send,
{
    fn handle(&mut self, req: &mut Request<'_>) -> Poll<Result<StatusCode, Error>> {
        self(req)
    }
}

/// Maps a request target to its handler.
pub trait Router: Send + Sync {
    fn route(&self, target: &str) -> Box<dyn Handler>;
}

type Factory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Exact path router.
///
/// ```
/// use weave::content::{Routes, Text};
///
/// let routes = Routes::new()
///     .route("/", Text::html("<h1>index</h1>"))
///     .route("/robots.txt", Text::plain("User-agent: *\n"));
/// ```
#[derive(Clone, Default)]
pub struct Routes {
    routes: HashMap<String, Factory>,
    prefixes: Vec<(String, Factory)>,
    fallback: Option<Factory>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `path` to a clone of `handler`.
    pub fn route<H>(self, path: impl Into<String>, handler: H) -> Self
    where
        H: Handler + Clone + Sync + 'static,
    {
        self.route_with(path, move || handler.clone())
    }

    /// Route `path` to a handler created by `f` for every request.
    pub fn route_with<F, H>(mut self, path: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.routes.insert(path.into(), Arc::new(move || -> Box<dyn Handler> { Box::new(f()) }));
        self
    }

    /// Route every path starting with `prefix` to a clone of `handler`.
    ///
    /// Exact routes win, then the longest prefix.
    pub fn prefix<H>(mut self, prefix: impl Into<String>, handler: H) -> Self
    where
        H: Handler + Clone + Sync + 'static,
    {
        self.prefixes.push((prefix.into(), Arc::new(move || -> Box<dyn Handler> { Box::new(handler.clone()) })));
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    /// Handler of unmatched paths, [`NotFound`] by default.
    pub fn fallback<F, H>(mut self, f: F) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.fallback = Some(Arc::new(move || -> Box<dyn Handler> { Box::new(f()) }));
        self
    }
}

impl Router for Routes {
    fn route(&self, target: &str) -> Box<dyn Handler> {
        let path = target.split_once('?').map_or(target, |(path, _)| path);
        let prefix = || self.prefixes.iter().find(|(p, _)| path.starts_with(p.as_str())).map(|(_, f)| f);
        match self.routes.get(path).or_else(prefix).or(self.fallback.as_ref()) {
            Some(factory) => factory(),
            None => Box::new(NotFound),
        }
    }
}

impl<R: Router + ?Sized> Router for Arc<R> {
    fn route(&self, target: &str) -> Box<dyn Handler> {
        R::route(self, target)
    }
}

impl std::fmt::Debug for Routes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routes")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("prefixes", &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
