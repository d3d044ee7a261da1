//! Terminal header stage.
use std::task::Poll;

use bytes::{BufMut, BytesMut};

use super::{HeaderFilter, HeaderNext};
use crate::buf::Buf;
use crate::error::Error;
use crate::filter::write::write_chain;
use crate::log::debug;
use crate::request::Request;
use crate::response::ResponseHead;

/// Serializes the response head of the main request.
///
/// Subrequest heads are swallowed, their output is part of the main response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderWriter;

impl HeaderFilter for HeaderWriter {
    fn header(&self, req: &mut Request<'_>, head: &mut ResponseHead, _: HeaderNext<'_>) -> Result<(), Error> {
        if !req.is_main() {
            return Ok(());
        }

        let bytes = encode(head);
        debug!("response head: {} bytes", bytes.len());

        let session = &mut *req.session;
        let chain = session.conn.pool.chain_from([Buf::from_bytes(bytes)])?;
        match write_chain(&mut session.conn, &session.engine.config, chain) {
            Poll::Ready(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

fn encode(head: &ResponseHead) -> BytesMut {
    let fields = head.headers.iter().map(|(n, v)| n.len() + v.len() + 4).sum::<usize>();
    let mut out = BytesMut::with_capacity(64 + fields);

    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(head.status.as_str().as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }

    match head.content_length {
        Some(len) => {
            out.put_slice(b"Content-Length: ");
            out.put_slice(itoa::Buffer::new().format(len).as_bytes());
            out.put_slice(b"\r\n");
        }
        None => out.put_slice(b"Connection: close\r\n"),
    }

    out.put_slice(b"\r\n");
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::response::StatusCode;

    #[test]
    fn head_encoding() {
        let head = ResponseHead::new(StatusCode::NOT_FOUND)
            .header("Content-Type", "text/plain")
            .header("Content-Length", "1")
            .content_length(12);
        assert_eq!(
            &encode(&head)[..],
            b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 12\r\n\r\n"
        );

        let head = ResponseHead::new(StatusCode::OK);
        assert_eq!(&encode(&head)[..], b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
    }
}
