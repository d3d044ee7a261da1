//! Terminal body stage.
//!
//! Collects output of the whole tree in the connection `out` chain and drains it to the
//! transport, honoring the postpone threshold, the rate limit and the send chunk limit.
use std::io::{self, IoSlice};
use std::task::Poll;
use std::time::Duration;

use super::{BodyFilter, BodyNext};
use crate::buf::Flags;
use crate::chain::Chain;
use crate::config::Config;
use crate::error::Error;
use crate::log::{debug, error, trace};
use crate::request::Request;
use crate::session::Connection;

/// Sends output to the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFilter;

impl BodyFilter for WriteFilter {
    fn body(&self, req: &mut Request<'_>, chain: Chain, _: BodyNext<'_>) -> Poll<Result<(), Error>> {
        let session = &mut *req.session;
        write_chain(&mut session.conn, &session.engine.config, chain)
    }
}

/// Append `input` to the pending output and send what the limits allow.
///
/// `Pending` when output is left over, it is sent on the next writable or timer event.
pub(crate) fn write_chain(conn: &mut Connection, config: &Config, input: Chain) -> Poll<Result<(), Error>> {
    if conn.error {
        conn.pool.free_chain(input);
        return Poll::Ready(Err(Error::closed()));
    }

    let has_input = !input.is_empty();
    conn.pool.append(&mut conn.out, input);

    let mut size = 0;
    let mut flush = false;
    let mut sync = false;
    let mut last = false;

    for id in conn.pool.iter(&conn.out) {
        let buf = &conn.pool[id];
        if buf.size() == 0 && !buf.is_sentinel() {
            error!("zero size buf in writer, flags: {:?}", buf.flags());
            return Poll::Ready(Err(Error::Invariant("zero size buffer in writer")));
        }
        size += buf.size();
        let flags = buf.flags();
        flush |= flags.contains(Flags::FLUSH);
        sync |= flags.contains(Flags::SYNC);
        last |= flags.contains(Flags::LAST);
    }

    trace!("write: size {size}, flush {flush}, last {last}");

    if !last && !flush && has_input && size < config.postpone_output as u64 {
        return Poll::Ready(Ok(()));
    }

    if conn.delayed {
        return Poll::Pending;
    }

    if size == 0 && !conn.transport.lowlevel_buffered() {
        if last || flush || sync {
            let out = std::mem::take(&mut conn.out);
            conn.pool.free_chain(out);
            return Poll::Ready(Ok(()));
        }
        error!("the output chain is empty");
        return Poll::Ready(Err(Error::Invariant("empty output without a control flag")));
    }

    let limit = match config.limit_rate {
        0 => config.sendfile_max_chunk,
        rate => {
            let rate = rate as i64;
            let elapsed = conn.elapsed.as_secs() as i64;
            let limit = rate * (elapsed + 1) - (conn.sent as i64 - config.limit_rate_after as i64);

            if limit <= 0 {
                conn.delayed = true;
                let delay = (-limit * 1000 / rate + 1) as u64;
                debug!("rate limit: delay {delay}ms");
                conn.transport.add_timer(Duration::from_millis(delay));
                return Poll::Pending;
            }

            match config.sendfile_max_chunk {
                chunk if chunk != 0 && chunk < limit as u64 => chunk,
                _ => limit as u64,
            }
        }
    };

    let before = conn.sent;
    let blocked = match send_chain(conn, limit, config.max_iovecs) {
        Ok(blocked) => blocked,
        Err(err) => {
            conn.error = true;
            return Poll::Ready(Err(err.into()));
        }
    };

    trace!("write: sent {} of {size}, limit {limit}", conn.sent - before);

    if config.limit_rate != 0 {
        let after = config.limit_rate_after;
        let sent = before.saturating_sub(after);
        let nsent = conn.sent.saturating_sub(after);
        let delay = (nsent - sent) * 1000 / config.limit_rate;
        if delay > 0 {
            conn.delayed = true;
            conn.transport.add_timer(Duration::from_millis(delay));
        }
    }

    if !conn.out.is_empty() {
        if blocked && !conn.delayed {
            conn.transport.add_timer(config.send_timeout);
        }
        return Poll::Pending;
    }

    if !conn.delayed {
        conn.transport.del_timer();
    }
    if conn.transport.lowlevel_buffered() {
        return Poll::Pending;
    }
    Poll::Ready(Ok(()))
}

/// Send the pending output, up to `limit` bytes, `0` is unbounded.
///
/// Memory buffers are gathered into one vectored call, contiguous file ranges are sent in
/// one call. Returns `true` if the transport would block.
fn send_chain(conn: &mut Connection, limit: u64, max_iovecs: usize) -> io::Result<bool> {
    let Connection { pool, transport, out, sent, .. } = conn;
    let limit = if limit == 0 { u64::MAX } else { limit };
    let mut total = 0;

    loop {
        // drops leading sentinels
        pool.update_sent(out, 0);
        let Some(head) = out.head() else {
            return Ok(false);
        };
        if total >= limit {
            return Ok(false);
        }
        let budget = limit - total;

        let buf = &pool[pool.link_buf(head)];
        let (attempt, result) = if buf.in_memory() {
            let mut slices = Vec::with_capacity(max_iovecs.min(16));
            let mut gathered = 0;
            let mut cur = Some(head);
            while let Some(link) = cur {
                let buf = &pool[pool.link_buf(link)];
                cur = pool.link_next(link);
                if buf.is_sentinel() {
                    continue;
                }
                if !buf.in_memory() || slices.len() == max_iovecs || gathered >= budget {
                    break;
                }
                let data = buf.as_slice();
                let take = data.len().min((budget - gathered).try_into().unwrap_or(usize::MAX));
                slices.push(IoSlice::new(&data[..take]));
                gathered += take as u64;
            }
            (gathered, transport.send(&slices))
        } else {
            let Some(region) = buf.file_region() else {
                return Err(io::Error::other("buffer without content in output"));
            };
            let (len, _) = pool.coalesce_file(head, budget);
            (len, transport.send_file(region.file(), region.pos(), len))
        };

        let n = match result {
            Ok(n) => n as u64,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        *sent += n;
        total += n;
        pool.update_sent(out, n);

        if n < attempt {
            return Ok(true);
        }
    }
}
