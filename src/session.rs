//! Connection session.
//!
//! A [`Session`] owns the request tree of one connection and drives it. The driver feeds it
//! events:
//!
//! - [`Session::run`] after creation and after [`Session::woken`] completes
//! - [`Session::on_writable`] when the transport accepts data again
//! - [`Session::on_timer`] when the timer armed through the transport expires
//!
//! and stops once [`Session::is_finished`] or [`Session::is_errored`].
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::buf::Buf;
use crate::chain::Chain;
use crate::config::Config;
use crate::content::{Handler, Router};
use crate::error::Error;
use crate::filter::{Filters, write};
use crate::log::{debug, error, info, trace, warning};
use crate::pool::Pool;
use crate::request::{ChildOutput, Cursor, Node, NodeId, Phase, Ref, Request, Special, Transition};
use crate::response::{ResponseHead, StatusCode};
use crate::slab::Slab;
use crate::transport::Transport;

/// Shared server state, every session of a server holds it.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) filters: Filters,
    pub(crate) router: Arc<dyn Router>,
}

impl Engine {
    /// Engine with the default filter chain.
    pub fn new<R: Router + 'static>(config: Config, router: R) -> Self {
        Self { config, filters: Filters::default(), router: Arc::new(router) }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

// ===== Connection =====

/// Connection level output state.
pub(crate) struct Connection {
    pub(crate) pool: Pool,
    pub(crate) transport: Box<dyn Transport>,
    /// Output accepted by the writer and not yet sent.
    pub(crate) out: Chain,
    pub(crate) sent: u64,
    /// Waiting for the rate limit timer.
    pub(crate) delayed: bool,
    pub(crate) error: bool,
    /// Time since the session started.
    pub(crate) elapsed: Duration,
}

// ===== Waker =====

pub(crate) struct Wake {
    node: NodeId,
    _hold: Ref,
}

/// Posts a request again from outside the session.
///
/// Holds the request alive until woken or dropped.
#[derive(Clone)]
pub struct Waker {
    tx: UnboundedSender<Wake>,
    node: NodeId,
    hold: Ref,
}

impl Waker {
    pub(crate) fn new(tx: UnboundedSender<Wake>, node: NodeId, hold: Ref) -> Self {
        Self { tx, node, hold }
    }

    pub fn wake(self) {
        let Self { tx, node, hold } = self;
        if tx.send(Wake { node, _hold: hold }).is_err() {
            debug!("wake of {node:?} after session closed");
        }
    }

    pub fn wake_by_ref(&self) {
        self.clone().wake();
    }
}

impl std::fmt::Debug for Waker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Waker").field(&self.node).finish()
    }
}

// ===== Session =====

/// Request tree of one connection.
pub struct Session {
    pub(crate) engine: Arc<Engine>,
    pub(crate) conn: Connection,
    pub(crate) nodes: Slab<Node>,
    pub(crate) main: NodeId,
    pub(crate) cursor: Cursor,
    /// Requests to run on this turn, each entry holds its request.
    pub(crate) posted: VecDeque<(NodeId, Ref)>,
    pub(crate) wake_tx: UnboundedSender<Wake>,
    wake_rx: UnboundedReceiver<Wake>,
}

impl Session {
    /// Create session for the main request `uri` and post it.
    pub fn new<T: Transport + 'static>(engine: Arc<Engine>, transport: T, uri: &str) -> Self {
        let handler = engine.router.route(uri);
        Self::with_handler(engine, transport, uri, handler)
    }

    /// Create session whose main request is served by `handler` instead of the router.
    pub fn with_handler<T: Transport + 'static>(
        engine: Arc<Engine>,
        transport: T,
        uri: &str,
        handler: Box<dyn Handler>,
    ) -> Self {
        let mut node = Node::new(uri.to_owned(), Some(handler), engine.config.redirects);
        node.subrequests = engine.config.subrequests;

        let mut nodes = Slab::new();
        let main = nodes.insert(node);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        let conn = Connection {
            pool: Pool::new(engine.config.pool_limit),
            transport: Box::new(transport),
            out: Chain::new(),
            sent: 0,
            delayed: false,
            error: false,
            elapsed: Duration::ZERO,
        };

        let mut me = Self {
            engine,
            conn,
            nodes,
            main,
            cursor: Cursor::new(main),
            posted: VecDeque::new(),
            wake_tx,
            wake_rx,
        };
        debug!("session {main:?} \"{uri}\"");
        me.post(main);
        me
    }

    #[inline]
    pub fn main_id(&self) -> NodeId {
        self.main
    }

    /// Request currently allowed to reach the connection.
    #[inline]
    pub fn active(&self) -> NodeId {
        self.cursor.active()
    }

    /// Bytes accepted by the transport.
    #[inline]
    pub fn sent(&self) -> u64 {
        self.conn.sent
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.conn.pool
    }

    /// Live requests, including finished ones not torn down yet.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every request is torn down.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn is_errored(&self) -> bool {
        self.conn.error
    }

    /// Output is waiting for the transport to become writable.
    #[inline]
    pub fn wants_write(&self) -> bool {
        !self.conn.error && !self.conn.delayed && !self.conn.out.is_empty()
    }

    /// Update the session clock used by rate limiting.
    #[inline]
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.conn.elapsed = elapsed;
    }

    /// Handle to request `id`.
    pub fn request(&mut self, id: NodeId) -> Option<Request<'_>> {
        self.nodes.contains(id).then(|| Request::new(self, id))
    }

    // ===== Events =====

    /// Wait for a wake from outside the session and post its request.
    ///
    /// Cancel safe, call [`Session::run`] afterwards.
    pub async fn woken(&mut self) {
        if let Some(wake) = self.wake_rx.recv().await {
            self.post(wake.node);
        }
    }

    /// Run posted requests until none is left, then tear down released requests.
    pub fn run(&mut self) {
        loop {
            while let Ok(wake) = self.wake_rx.try_recv() {
                self.post(wake.node);
            }
            let Some((id, _hold)) = self.posted.pop_front() else {
                break;
            };
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            node.posted = false;
            if node.done {
                continue;
            }

            trace!("run {id:?} {:?}", node.phase);
            match node.phase {
                Phase::Content => self.run_handler(id),
                Phase::Writer => self.run_writer(id),
                Phase::Finalizer => self.finalize_inner(id),
                Phase::Idle => {}
            }
        }
        self.reap();
    }

    /// The transport is writable again.
    pub fn on_writable(&mut self) {
        if self.conn.error || self.nodes.is_empty() {
            return;
        }
        if !self.conn.out.is_empty() {
            let config = &self.engine.config;
            if let Poll::Ready(Err(err)) = write::write_chain(&mut self.conn, config, Chain::new()) {
                self.terminate(&err);
                return;
            }
        }
        let active = self.cursor.active();
        self.post(active);
        self.run();
    }

    /// The transport timer expired.
    ///
    /// Ends a rate limit delay, otherwise the peer did not accept output in time.
    pub fn on_timer(&mut self) {
        if self.conn.delayed {
            self.conn.delayed = false;
            trace!("rate limit delay expired");
            self.on_writable();
            return;
        }
        if self.conn.error || self.nodes.is_empty() {
            return;
        }
        info!("client timed out");
        self.terminate(&Error::Transport(io::ErrorKind::TimedOut.into()));
    }

    /// Terminate every request and release the pool.
    pub fn close(&mut self) {
        if !self.nodes.is_empty() && !self.conn.error {
            self.terminate(&Error::Transport(io::ErrorKind::ConnectionAborted.into()));
        }
        self.conn.pool.destroy();
    }

    // ===== Scheduling =====

    /// Schedule `id` to run on this turn.
    pub(crate) fn post(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.posted || node.done {
            return;
        }
        node.posted = true;
        let hold = Ref::new(&node.counter);
        self.posted.push_back((id, hold));
    }

    fn run_handler(&mut self, id: NodeId) {
        // resume draining the queue that stopped at a subrequest
        if self.cursor.is(id) && !self.nodes[id].postponed.is_empty() {
            if let Poll::Ready(Err(err)) = Request::new(self, id).submit(Chain::new()) {
                return self.fail(id, err);
            }
        }

        let node = &mut self.nodes[id];
        let Some(mut handler) = node.handler.take() else {
            return;
        };
        node.redirected = false;

        let poll = handler.handle(&mut Request::new(self, id));

        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.redirected {
            if let Poll::Ready(Err(err)) = poll {
                self.fail(id, err);
            }
            return;
        }

        match poll {
            Poll::Pending => {
                if !node.done && node.handler.is_none() {
                    node.handler = Some(handler);
                }
            }
            Poll::Ready(Ok(status)) => {
                drop(handler);
                if self.finalize(id, status).is_err() {
                    debug!("handler of {id:?} finished a finalized request");
                }
            }
            Poll::Ready(Err(err)) => self.fail(id, err),
        }
    }

    fn run_writer(&mut self, id: NodeId) {
        if !self.cursor.is(id) {
            return;
        }
        if let Poll::Ready(Err(err)) = Request::new(self, id).submit(Chain::new()) {
            self.terminate(&err);
            return;
        }

        let node = &self.nodes[id];
        let pending = !node.postponed.is_empty()
            || (node.parent.is_none() && (!self.conn.out.is_empty() || self.conn.transport.lowlevel_buffered()));
        if pending {
            trace!("writer {id:?} blocked");
            return;
        }
        self.finalize_inner(id);
    }

    fn fail(&mut self, id: NodeId, err: Error) {
        if err.is_fatal() {
            self.terminate(&err);
            return;
        }
        warning!("{:?} \"{}\": {err}", id, self.nodes[id].uri);
        if self.finalize(id, StatusCode::INTERNAL_SERVER_ERROR).is_err() {
            self.finalize_inner(id);
        }
    }

    // ===== Finalization =====

    /// Finish request `id` with `status`.
    ///
    /// A request is finalized once, further calls are rejected. An error status answers
    /// with a generated page when no output was sent yet.
    pub fn finalize(&mut self, id: NodeId, status: StatusCode) -> Result<(), Error> {
        let Some(node) = self.nodes.get_mut(id) else {
            return Err(Error::Invariant("finalize of a released request"));
        };
        if node.finalized {
            error!("{id:?} finalized twice");
            return Err(Error::Invariant("request finalized twice"));
        }
        node.finalized = true;
        node.handler = None;
        debug!("finalize {id:?} \"{}\" {status}", node.uri);

        let poll = if status.is_special() {
            self.special_response(id, status)
        } else {
            Request::new(self, id).send_special(Special::Last)
        };
        if let Poll::Ready(Err(err)) = poll {
            self.terminate(&err);
            return Ok(());
        }

        self.finalize_inner(id);
        Ok(())
    }

    /// Complete a finalized request once its output can go.
    fn finalize_inner(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.done {
            return;
        }

        let Some(parent) = node.parent else {
            if !node.postponed.is_empty()
                || !self.conn.out.is_empty()
                || self.conn.transport.lowlevel_buffered()
            {
                node.phase = Phase::Writer;
                return;
            }
            if !self.cursor.is(id) {
                debug!("finalize non-active main request");
                node.phase = Phase::Writer;
                return;
            }
            node.done = true;
            node.phase = Phase::Idle;
            node.own = None;
            self.conn.transport.del_timer();
            debug!("request done, {} bytes sent", self.conn.sent);
            return;
        };

        if !node.postponed.is_empty() {
            node.phase = Phase::Writer;
            return;
        }
        if !self.cursor.is(id) {
            node.phase = Phase::Finalizer;
            self.post(parent);
            return;
        }

        node.done = true;
        node.phase = Phase::Idle;
        node.own = None;
        let capture = node.capture.take();
        let status = node.status;

        if let Some(capture) = capture {
            let body = match capture.buf {
                Some(buf) => {
                    let body = self.conn.pool[buf].to_bytes();
                    self.conn.pool.free(buf);
                    body
                }
                None => Default::default(),
            };
            self.nodes[parent].outputs.push((id, ChildOutput { status, body }));
        }

        if self.nodes[parent].postponed.pop_child(id) {
            self.nodes[id].queued = false;
        }
        self.cursor.step(Transition::Return { from: id, to: parent });
        debug!("subrequest {id:?} done, {parent:?} active");
        self.post(parent);
    }

    fn special_response(&mut self, id: NodeId, status: StatusCode) -> Poll<Result<(), Error>> {
        let node = &mut self.nodes[id];
        node.status = status;

        let is_main = node.parent.is_none();
        let untouched = if is_main { !node.header_sent } else { !node.output };
        let can_page = node.capture.is_none() && untouched;
        if !can_page {
            if is_main && node.header_sent {
                warning!("{status} after the header was sent");
            }
            return Request::new(self, id).send_special(Special::Last);
        }

        let page = error_page(status);
        let mut req = Request::new(self, id);
        if is_main {
            let head = ResponseHead::new(status)
                .header("Content-Type", "text/html")
                .content_length(page.len() as u64);
            req.send_header(head)?;
        }
        let chain = req.pool().chain_from([Buf::from_bytes(page).with_flags(crate::buf::Flags::LAST)])?;
        req.submit(chain)
    }

    // ===== Teardown =====

    /// Abort the whole tree after a fatal error.
    ///
    /// Postponed output is dropped without being sent, no request is resumed.
    pub(crate) fn terminate(&mut self, err: &Error) {
        match err {
            Error::Transport(err) => {
                info!("connection error: {err}");
            }
            err => {
                error!("terminate request: {err}");
            }
        }
        self.conn.error = true;
        self.posted.clear();

        for node in self.nodes.values_mut() {
            node.postponed.clear(&mut self.conn.pool);
            if let Some(buf) = node.capture.take().and_then(|c| c.buf) {
                self.conn.pool.free(buf);
            }
            node.queued = false;
            node.posted = false;
            node.done = true;
            node.phase = Phase::Idle;
            node.handler = None;
            node.own = None;
        }

        let out = mem::take(&mut self.conn.out);
        self.conn.pool.free_chain(out);
        self.conn.delayed = false;
        self.conn.transport.del_timer();
        self.reap();
    }

    /// Remove every request that is done and no longer referenced.
    fn reap(&mut self) {
        loop {
            let released = self
                .nodes
                .keys()
                .filter(|id| self.nodes[*id].is_released())
                .collect::<Vec<_>>();
            if released.is_empty() {
                break;
            }

            for id in released {
                let Some(mut node) = self.nodes.remove(id) else {
                    continue;
                };
                if !node.postponed.is_empty() {
                    if !self.conn.error {
                        error!("{id:?} released with {} postponed entries", node.postponed.len());
                    }
                    for child in node.postponed.clear(&mut self.conn.pool) {
                        if let Some(child) = self.nodes.get_mut(child) {
                            child.queued = false;
                        }
                    }
                }
                debug!("release {id:?} \"{}\"", node.uri);
                // drops the hold on the parent
                drop(node);
            }
        }
    }
}

/// Generated body of an error response.
fn error_page(status: StatusCode) -> String {
    format!(
        "<html>\r\n<head><title>{status}</title></head>\r\n<body>\r\n\
         <center><h1>{status}</h1></center>\r\n<hr><center>weave</center>\r\n\
         </body>\r\n</html>\r\n"
    )
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("main", &self.main)
            .field("active", &self.cursor.active())
            .field("nodes", &self.nodes.len())
            .field("posted", &self.posted.len())
            .field("sent", &self.conn.sent)
            .field("error", &self.conn.error)
            .finish_non_exhaustive()
    }
}
