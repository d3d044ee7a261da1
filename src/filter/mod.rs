//! Header and body filter chains.
//!
//! Both chains are ordered lists built once per [`Engine`][crate::Engine]. A stage receives
//! the rest of the chain as [`Next`] and decides whether and what to pass on. Stages
//! registered later run earlier, the terminal stages are registered first by
//! [`Filters::new`].
use std::sync::Arc;
use std::task::Poll;

use crate::chain::Chain;
use crate::error::Error;
use crate::request::Request;
use crate::response::ResponseHead;

mod addition;
mod header;
mod postpone;
pub(crate) mod write;

pub use addition::Addition;
pub use header::HeaderWriter;
pub use postpone::Postpone;
pub use write::WriteFilter;

/// Body processing stage.
pub trait BodyFilter: Send + Sync {
    /// Process `chain` of `req`, an empty chain asks to flush pending output.
    fn body(&self, req: &mut Request<'_>, chain: Chain, next: BodyNext<'_>) -> Poll<Result<(), Error>>;
}

/// Header processing stage.
pub trait HeaderFilter: Send + Sync {
    fn header(&self, req: &mut Request<'_>, head: &mut ResponseHead, next: HeaderNext<'_>) -> Result<(), Error>;
}

/// Remaining stages of a chain.
pub struct Next<'a, F: ?Sized> {
    rest: &'a [Arc<F>],
}

pub type BodyNext<'a> = Next<'a, dyn BodyFilter>;

pub type HeaderNext<'a> = Next<'a, dyn HeaderFilter>;

impl<F: ?Sized> Clone for Next<'_, F> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<F: ?Sized> Copy for Next<'_, F> { }

impl<F: ?Sized> Next<'_, F> {
    /// Number of stages left.
    #[inline]
    pub fn len(&self) -> usize {
        self.rest.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }
}

impl Next<'_, dyn BodyFilter> {
    /// Pass `chain` to the next stage.
    pub fn call(self, req: &mut Request<'_>, chain: Chain) -> Poll<Result<(), Error>> {
        match self.rest.split_first() {
            Some((filter, rest)) => filter.body(req, chain, Next { rest }),
            None => {
                req.pool().free_chain(chain);
                Poll::Ready(Err(Error::Invariant("body filter chain without terminal stage")))
            }
        }
    }
}

impl Next<'_, dyn HeaderFilter> {
    /// Pass `head` to the next stage.
    pub fn call(self, req: &mut Request<'_>, head: &mut ResponseHead) -> Result<(), Error> {
        match self.rest.split_first() {
            Some((filter, rest)) => filter.header(req, head, Next { rest }),
            None => Err(Error::Invariant("header filter chain without terminal stage")),
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for Next<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("len", &self.rest.len()).finish()
    }
}

// ===== Filters =====

/// Ordered header and body chains.
///
/// ```
/// use weave::filter::{Addition, Filters};
///
/// let addition = Addition::new().before("/header").after("/footer");
/// let filters = Filters::default()
///     .header(addition.clone())
///     .body(addition);
/// ```
#[derive(Clone)]
pub struct Filters {
    header: Vec<Arc<dyn HeaderFilter>>,
    body: Vec<Arc<dyn BodyFilter>>,
}

impl Filters {
    /// Chains with the terminal stages only.
    pub fn new() -> Self {
        Self {
            header: vec![Arc::new(HeaderWriter)],
            body: vec![Arc::new(WriteFilter)],
        }
    }

    /// Register a header stage ahead of every stage registered before.
    pub fn header<F: HeaderFilter + 'static>(mut self, filter: F) -> Self {
        self.header.insert(0, Arc::new(filter));
        self
    }

    /// Register a body stage ahead of every stage registered before.
    pub fn body<F: BodyFilter + 'static>(mut self, filter: F) -> Self {
        self.body.insert(0, Arc::new(filter));
        self
    }

    #[inline]
    pub(crate) fn header_chain(&self) -> HeaderNext<'_> {
        Next { rest: &self.header }
    }

    #[inline]
    pub(crate) fn body_chain(&self) -> BodyNext<'_> {
        Next { rest: &self.body }
    }
}

impl Default for Filters {
    /// Terminal stages and the postponement scheduler.
    fn default() -> Self {
        Self::new().body(Postpone)
    }
}

impl std::fmt::Debug for Filters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filters")
            .field("header", &self.header.len())
            .field("body", &self.body.len())
            .finish()
    }
}
