//! Document wrapping through subrequests.
use std::task::Poll;

use super::{BodyFilter, BodyNext, HeaderFilter, HeaderNext};
use crate::buf::{Buf, Flags};
use crate::chain::Chain;
use crate::error::Error;
use crate::log::debug;
use crate::request::{ChildOptions, Request};
use crate::response::ResponseHead;

/// Adds the output of a `before` subrequest ahead of the main response body and of an
/// `after` subrequest behind it.
///
/// Register as both a header and a body stage.
#[derive(Debug, Clone)]
pub struct Addition {
    before: Option<String>,
    after: Option<String>,
    types: Vec<String>,
}

/// Per request state, present while additions are pending.
#[derive(Debug)]
struct State {
    before_pending: bool,
}

impl Addition {
    /// Applies to `text/html` responses.
    pub fn new() -> Self {
        Self { before: None, after: None, types: vec!["text/html".into()] }
    }

    pub fn before(mut self, uri: impl Into<String>) -> Self {
        self.before = Some(uri.into());
        self
    }

    pub fn after(mut self, uri: impl Into<String>) -> Self {
        self.after = Some(uri.into());
        self
    }

    /// Media types the additions apply to.
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    fn applies(&self, head: &ResponseHead) -> bool {
        let Some(content_type) = head.content_type() else {
            return false;
        };
        self.types.iter().any(|t| t == "*" || t.eq_ignore_ascii_case(content_type))
    }
}

impl Default for Addition {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderFilter for Addition {
    fn header(&self, req: &mut Request<'_>, head: &mut ResponseHead, next: HeaderNext<'_>) -> Result<(), Error> {
        if !req.is_main() || (self.before.is_none() && self.after.is_none()) || !self.applies(head) {
            return next.call(req, head);
        }

        debug!("addition for \"{}\"", req.uri());
        req.set_ctx(State { before_pending: self.before.is_some() });
        // the body length changes
        head.content_length = None;
        next.call(req, head)
    }
}

impl BodyFilter for Addition {
    fn body(&self, req: &mut Request<'_>, chain: Chain, next: BodyNext<'_>) -> Poll<Result<(), Error>> {
        let before_pending = match req.ctx_mut::<State>() {
            Some(state) => std::mem::take(&mut state.before_pending),
            None => return next.call(req, chain),
        };

        if before_pending {
            if let Some(before) = &self.before {
                if let Err(err) = req.create_child(before, ChildOptions::default()) {
                    req.pool().free_chain(chain);
                    return Poll::Ready(Err(err));
                }
            }
        }

        let Some(after) = &self.after else {
            req.remove_ctx::<State>();
            return next.call(req, chain);
        };

        // the final marker goes out after the `after` subrequest
        let mut last = false;
        req.pool().for_each_mut(&chain, |buf| {
            if buf.flags().contains(Flags::LAST) {
                buf.clear_flags(Flags::LAST);
                buf.set_flags(Flags::LAST_IN_CHAIN | Flags::SYNC);
                last = true;
            }
        });

        let poll = next.call(req, chain);
        if !last || matches!(poll, Poll::Ready(Err(_))) {
            return poll;
        }

        req.create_child(after, ChildOptions::default())?;
        req.remove_ctx::<State>();
        let last = req.pool().chain_from([Buf::sentinel(Flags::LAST)])?;
        req.submit(last)
    }
}
