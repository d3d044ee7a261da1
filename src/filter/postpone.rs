//! Output ordering of the request tree.
//!
//! Only the active request reaches the connection. Output of any other request is queued on
//! that request, behind the subrequests it created before. Draining the queue of the active
//! request hands the connection to the next queued subrequest, so the connection sees every
//! request output in document order.
use std::task::Poll;

use super::{BodyFilter, BodyNext};
use crate::buf::{Buf, Flags};
use crate::chain::Chain;
use crate::error::{BudgetExceeded, Error};
use crate::log::{debug, error, trace};
use crate::pool::Pool;
use crate::request::{Capture, Entry, NodeId, Request, Transition};
use crate::session::Session;

/// Postponement scheduler stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postpone;

impl BodyFilter for Postpone {
    fn body(&self, req: &mut Request<'_>, chain: Chain, next: BodyNext<'_>) -> Poll<Result<(), Error>> {
        let id = req.id();
        if req.node().capture.is_some() {
            return Poll::Ready(capture(req.session, id, chain));
        }

        let session = &mut *req.session;
        if !session.cursor.is(id) {
            postpone(session, id, chain);
            return Poll::Ready(Ok(()));
        }

        if session.nodes[id].postponed.is_empty() {
            if chain.is_empty() && session.conn.out.is_empty() {
                return Poll::Ready(Ok(()));
            }
            return next.call(&mut req.main(), chain);
        }

        postpone(session, id, chain);
        drain(req, next)
    }
}

/// Queue `chain` on request `id`.
///
/// A final marker entering a queue is held back, the queue may still gain subrequests
/// behind it.
fn postpone(session: &mut Session, id: NodeId, chain: Chain) {
    if chain.is_empty() {
        return;
    }
    let Session { nodes, conn, .. } = session;
    let node = &mut nodes[id];

    let mut last = false;
    conn.pool.for_each_mut(&chain, |buf| {
        if buf.flags().contains(Flags::LAST) {
            buf.clear_flags(Flags::LAST);
            buf.set_flags(Flags::LAST_IN_CHAIN | Flags::SYNC);
            last = true;
        }
    });
    node.deferred_last |= last;

    trace!("postpone {id:?}: {} bytes", conn.pool.chain_size(&chain));
    node.postponed.push_data(&mut conn.pool, chain);
}

/// Forward queued output of the active request until the queue is empty or a subrequest
/// takes over the connection.
fn drain(req: &mut Request<'_>, next: BodyNext<'_>) -> Poll<Result<(), Error>> {
    let id = req.id();
    let mut poll = Poll::Ready(Ok(()));

    loop {
        let session = &mut *req.session;
        let Some(entry) = session.nodes[id].postponed.pop_front() else {
            break;
        };

        match entry {
            Entry::Child(child) => {
                let Some(node) = session.nodes.get_mut(child) else {
                    error!("postponed subrequest {child:?} of {id:?} is gone");
                    return Poll::Ready(Err(Error::Invariant("postponed subrequest without a request")));
                };
                node.queued = false;
                debug!("postpone: {child:?} active");
                session.cursor.step(Transition::Activate(child));
                session.post(child);
                return Poll::Ready(Ok(()));
            }
            Entry::Data(out) => {
                trace!("postpone: output {id:?}");
                match next.call(&mut req.main(), out) {
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    ready => poll = ready,
                }
            }
        }
    }

    let node = req.node_mut();
    if node.deferred_last && node.main.is_none() {
        node.deferred_last = false;
        let last = req.pool().chain_from([Buf::sentinel(Flags::LAST)])?;
        return next.call(req, last);
    }
    poll
}

/// Copy output of an in-memory subrequest into its capture buffer.
fn capture(session: &mut Session, id: NodeId, chain: Chain) -> Result<(), Error> {
    let Session { nodes, conn, .. } = session;
    let result = match &mut nodes[id].capture {
        Some(capture) => capture_chain(&mut conn.pool, capture, &chain),
        None => Ok(()),
    };
    conn.pool.free_chain(chain);
    result
}

fn capture_chain(pool: &mut Pool, capture: &mut Capture, chain: &Chain) -> Result<(), Error> {
    let dst = match capture.buf {
        Some(dst) => dst,
        None => {
            let dst = pool.allocate(capture.limit)?;
            capture.buf = Some(dst);
            dst
        }
    };

    for src in pool.iter(chain).collect::<Vec<_>>() {
        let buf = &pool[src];
        if buf.is_sentinel() {
            continue;
        }
        if buf.size() > pool[dst].spare() as u64 {
            error!("too big subrequest response, limit is {} bytes", capture.limit);
            return Err(BudgetExceeded::SubrequestOutput { limit: capture.limit }.into());
        }

        if buf.in_memory() {
            let data = buf.to_bytes();
            pool[dst].write(&data);
        } else if let Some(region) = buf.file_region().cloned() {
            let mut data = vec![0; region.len() as usize];
            region.file().read_exact_at(&mut data, region.pos())?;
            pool[dst].write(&data);
        }
        pool[src].consume();
    }
    Ok(())
}
