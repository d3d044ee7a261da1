//! Error types.
use std::io;

/// Request processing error.
///
/// Blocking is not an error, it is reported as [`Poll::Pending`][std::task::Poll] by every
/// filter and by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arena exhausted.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Socket or file fault, the connection is unusable afterwards.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Programming defect, the request tree is aborted.
    #[error("invariant violation: {0}")]
    Invariant(&'static str),
    /// A budget ran out, the operation is rejected.
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),
}

impl Error {
    /// Returns `true` if the error aborts the whole request tree.
    ///
    /// Budget errors only affect the request that hit them.
    #[inline]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Budget(_))
    }

    /// Output attempted on a connection that already failed.
    pub(crate) fn closed() -> Self {
        Self::Transport(io::ErrorKind::BrokenPipe.into())
    }
}

/// Arena allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("pool exhausted: requested {requested} bytes, {available} available")]
pub struct AllocError {
    pub requested: usize,
    pub available: usize,
}

/// Monotonic budget exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BudgetExceeded {
    /// No subrequest can be created anymore.
    #[error("too many subrequests")]
    Subrequests,
    /// Internal redirection cycle.
    #[error("rewrite or internal redirection cycle")]
    Redirects,
    /// In-memory subrequest produced more output than can be captured.
    #[error("too big subrequest response, limit is {limit} bytes")]
    SubrequestOutput { limit: usize },
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid size for {key}: {value:?}")]
    InvalidSize { key: &'static str, value: String },
    #[error("invalid duration for {key}: {value:?}")]
    InvalidDuration { key: &'static str, value: String },
    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}
