use std::task::Poll;

use bytes::Bytes;

use super::Handler;
use crate::buf::{Buf, Flags};
use crate::error::Error;
use crate::request::Request;
use crate::response::{ResponseHead, StatusCode};

/// Fixed response body.
#[derive(Debug, Clone)]
pub struct Text {
    body: Bytes,
    content_type: &'static str,
    status: StatusCode,
}

impl Text {
    pub fn new(content_type: &'static str, body: impl Into<Bytes>) -> Self {
        Self { body: body.into(), content_type, status: StatusCode::OK }
    }

    /// `text/plain` body.
    pub fn plain(body: impl Into<Bytes>) -> Self {
        Self::new("text/plain", body)
    }

    /// `text/html` body.
    pub fn html(body: impl Into<Bytes>) -> Self {
        Self::new("text/html", body)
    }

    /// Builder style response status.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl Handler for Text {
    fn handle(&mut self, req: &mut Request<'_>) -> Poll<Result<StatusCode, Error>> {
        let head = ResponseHead::new(self.status)
            .header("Content-Type", self.content_type)
            .content_length(self.body.len() as u64);
        req.send_header(head)?;

        let buf = match self.body.is_empty() {
            true => Buf::sentinel(Flags::LAST),
            false => Buf::from_bytes(self.body.clone()).with_flags(Flags::LAST),
        };
        let chain = req.pool().chain_from([buf])?;
        if let Poll::Ready(Err(err)) = req.submit(chain) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(StatusCode::OK))
    }
}

/// Answers with the generated `404` page.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl Handler for NotFound {
    fn handle(&mut self, _: &mut Request<'_>) -> Poll<Result<StatusCode, Error>> {
        Poll::Ready(Ok(StatusCode::NOT_FOUND))
    }
}
