//! Request tree.
//!
//! A connection serves one main request and any number of nested subrequests. Every
//! request is a [`Node`] in the session slab, referenced by [`NodeId`]. Handlers and filters
//! see a request through the [`Request`] handle.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;

use bytes::Bytes;

use crate::buf::{Buf, Flags};
use crate::chain::Chain;
use crate::config::Config;
use crate::content::Handler;
use crate::error::{BudgetExceeded, Error};
use crate::log::{debug, error, warning};
use crate::pool::{BufId, Pool};
use crate::response::{ResponseHead, StatusCode};
use crate::session::{Session, Waker};
use crate::slab::Key;

mod count;
mod cursor;
mod postponed;

pub use count::{Block, Ref};
pub(crate) use count::Counter;
pub(crate) use cursor::{Cursor, Transition};
pub(crate) use postponed::{Entry, Postponed};

/// Request handle, resolves only within its session.
pub type NodeId = Key<Node>;

/// Processing phase, selects what runs when a request is posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// The content handler produces output.
    Content,
    /// Finished, flushing postponed or pending output.
    Writer,
    /// Finished while another request owned the connection.
    Finalizer,
    Idle,
}

/// In-memory capture of subrequest output.
#[derive(Debug)]
pub(crate) struct Capture {
    pub(crate) buf: Option<BufId>,
    pub(crate) limit: usize,
}

/// Request state.
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    /// `None` for the main request.
    pub(crate) main: Option<NodeId>,
    pub(crate) uri: String,
    pub(crate) postponed: Postponed,
    pub(crate) counter: Arc<Counter>,
    /// Hold released when the request is done.
    pub(crate) own: Option<Ref>,
    /// Hold of a subrequest on its parent, released on teardown.
    pub(crate) parent_ref: Option<Ref>,
    pub(crate) subrequests: u32,
    pub(crate) redirects: u8,
    pub(crate) redirected: bool,
    pub(crate) phase: Phase,
    pub(crate) done: bool,
    pub(crate) finalized: bool,
    pub(crate) status: StatusCode,
    pub(crate) handler: Option<Box<dyn Handler>>,
    pub(crate) header_sent: bool,
    /// Submitted payload bytes.
    pub(crate) output: bool,
    /// Submitted the final marker.
    pub(crate) last_sent: bool,
    /// Final marker held back until the queue drains.
    pub(crate) deferred_last: bool,
    pub(crate) capture: Option<Capture>,
    pub(crate) outputs: Vec<(NodeId, ChildOutput)>,
    pub(crate) ctx: HashMap<TypeId, Box<dyn Any + Send>>,
    pub(crate) posted: bool,
    /// Target of a `Child` entry in the parent queue.
    pub(crate) queued: bool,
}

impl Node {
    pub(crate) fn new(uri: String, handler: Option<Box<dyn Handler>>, redirects: u8) -> Self {
        let counter = Counter::new();
        Self {
            parent: None,
            main: None,
            uri,
            postponed: Postponed::default(),
            own: Some(Ref::new(&counter)),
            counter,
            parent_ref: None,
            subrequests: 0,
            redirects,
            redirected: false,
            phase: Phase::Content,
            done: false,
            finalized: false,
            status: StatusCode::OK,
            handler,
            header_sent: false,
            output: false,
            last_sent: false,
            deferred_last: false,
            capture: None,
            outputs: Vec::new(),
            ctx: HashMap::new(),
            posted: false,
            queued: false,
        }
    }

    /// Eligible for teardown.
    pub(crate) fn is_released(&self) -> bool {
        self.done && !self.queued && !self.posted && self.counter.is_released()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("uri", &self.uri)
            .field("parent", &self.parent)
            .field("phase", &self.phase)
            .field("count", &self.counter.count())
            .field("postponed", &self.postponed.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

// ===== Options =====

/// Subrequest creation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildOptions {
    /// Capture the output in memory for the parent instead of emitting it.
    pub in_memory: bool,
}

/// Captured output of a finished in-memory subrequest.
#[derive(Debug, Clone)]
pub struct ChildOutput {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Payload-less control output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    /// End of the request output.
    Last,
    /// Send everything pending.
    Flush,
}

// ===== Request =====

/// Handle to one request of a session.
pub struct Request<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) id: NodeId,
}

impl<'a> Request<'a> {
    pub(crate) fn new(session: &'a mut Session, id: NodeId) -> Self {
        Self { session, id }
    }

    #[inline]
    pub(crate) fn node(&self) -> &Node {
        &self.session.nodes[self.id]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self) -> &mut Node {
        &mut self.session.nodes[self.id]
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn uri(&self) -> &str {
        &self.node().uri
    }

    /// Path component of the uri.
    pub fn path(&self) -> &str {
        let uri = self.uri();
        uri.split_once('?').map_or(uri, |(path, _)| path)
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.node().main.is_none()
    }

    #[inline]
    pub fn main_id(&self) -> NodeId {
        self.node().main.unwrap_or(self.id)
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.node().parent
    }

    /// This request owns the connection.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.session.cursor.is(self.id)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.session.engine.config
    }

    /// Connection pool.
    #[inline]
    pub fn pool(&mut self) -> &mut Pool {
        &mut self.session.conn.pool
    }

    /// Subrequests the tree may still create.
    pub fn remaining_subrequests(&self) -> u32 {
        self.session.nodes[self.main_id()].subrequests
    }

    /// Handle to the main request.
    pub fn main(&mut self) -> Request<'_> {
        let id = self.main_id();
        Request { session: &mut *self.session, id }
    }

    // ===== Output =====

    /// Pass the response head through the header filters.
    pub fn send_header(&mut self, mut head: ResponseHead) -> Result<(), Error> {
        if self.node().header_sent {
            error!("header already sent: {:?}", self.id);
            return Err(Error::Invariant("header already sent"));
        }
        let node = self.node_mut();
        node.header_sent = true;
        node.status = head.status;

        let engine = Arc::clone(&self.session.engine);
        engine.filters.header_chain().call(self, &mut head)
    }

    /// Pass output through the body filters.
    ///
    /// `Pending` means the connection is blocked, the output is kept and sent once it is
    /// writable again.
    pub fn submit(&mut self, chain: Chain) -> Poll<Result<(), Error>> {
        if self.session.conn.error {
            self.pool().free_chain(chain);
            return Poll::Ready(Err(Error::closed()));
        }

        let is_main = self.is_main();
        let mut payload = false;
        let mut last = false;
        self.pool().for_each_mut(&chain, |buf| {
            payload |= !buf.is_sentinel();
            if buf.flags().intersects(Flags::LAST | Flags::LAST_IN_CHAIN) {
                last = true;
            }
            // only the main request terminates the response
            if !is_main && buf.flags().contains(Flags::LAST) {
                buf.clear_flags(Flags::LAST);
                buf.set_flags(Flags::LAST_IN_CHAIN | Flags::SYNC);
            }
        });

        let node = self.node_mut();
        node.output |= payload;
        node.last_sent |= last;

        self.forward(chain)
    }

    /// Submit a read only buffer of `data`.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Poll<Result<(), Error>> {
        let data = data.into();
        if data.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let chain = self.pool().chain_from([Buf::from_bytes(data)])?;
        self.submit(chain)
    }

    /// Submit a control sentinel.
    ///
    /// The final marker is submitted at most once.
    pub fn send_special(&mut self, special: Special) -> Poll<Result<(), Error>> {
        let flags = match special {
            Special::Last if self.node().last_sent => return Poll::Ready(Ok(())),
            Special::Last => Flags::LAST,
            Special::Flush => Flags::FLUSH,
        };
        let chain = self.pool().chain_from([Buf::sentinel(flags)])?;
        self.submit(chain)
    }

    pub(crate) fn forward(&mut self, chain: Chain) -> Poll<Result<(), Error>> {
        let engine = Arc::clone(&self.session.engine);
        engine.filters.body_chain().call(self, chain)
    }

    // ===== Subrequests =====

    /// Spawn a subrequest for `target`.
    ///
    /// Its output takes the current position in this request output. Fails with
    /// [`BudgetExceeded::Subrequests`] once the tree budget is spent.
    pub fn create_child(&mut self, target: &str, options: ChildOptions) -> Result<NodeId, Error> {
        let parent = self.id;
        let session = &mut *self.session;
        if session.conn.error {
            return Err(Error::closed());
        }

        let main = session.main;
        let budget = &mut session.nodes[main].subrequests;
        if *budget == 0 {
            warning!("subrequests cycle while processing \"{target}\"");
            return Err(BudgetExceeded::Subrequests.into());
        }
        *budget -= 1;

        let config = &session.engine.config;
        let handler = session.engine.router.route(target);
        let mut node = Node::new(target.to_owned(), Some(handler), config.redirects);
        node.parent = Some(parent);
        node.main = Some(main);
        node.parent_ref = Some(Ref::new(&session.nodes[parent].counter));
        node.queued = true;
        if options.in_memory {
            node.capture = Some(Capture { buf: None, limit: config.subrequest_output_buffer_size });
        }
        let child = session.nodes.insert(node);

        let queue = &mut session.nodes[parent].postponed;
        let activate = session.cursor.is(parent) && queue.is_empty();
        queue.push_child(child);
        if activate {
            session.cursor.step(Transition::Activate(child));
        }
        session.post(child);

        debug!("subrequest \"{target}\" {child:?} of {parent:?}, active: {activate}");
        Ok(child)
    }

    /// Take the captured output of a finished in-memory subrequest.
    pub fn take_child_output(&mut self, child: NodeId) -> Option<ChildOutput> {
        let outputs = &mut self.node_mut().outputs;
        let at = outputs.iter().position(|(id, _)| *id == child)?;
        Some(outputs.swap_remove(at).1)
    }

    /// Restart this request with the handler of `target`.
    ///
    /// The running handler should return `Pending`, its result is ignored.
    pub fn redirect(&mut self, target: &str) -> Result<(), Error> {
        let id = self.id;
        let session = &mut *self.session;
        let node = &mut session.nodes[id];
        if node.redirects == 0 {
            warning!("rewrite or internal redirection cycle while redirecting to \"{target}\"");
            return Err(BudgetExceeded::Redirects.into());
        }
        node.redirects -= 1;
        node.redirected = true;
        node.uri = target.to_owned();
        node.handler = Some(session.engine.router.route(target));
        node.ctx.clear();
        node.phase = Phase::Content;
        session.post(id);

        debug!("redirect {id:?} to \"{target}\"");
        Ok(())
    }

    // ===== Suspension =====

    /// Keep the request alive until the returned hold is dropped.
    pub fn hold(&self) -> Ref {
        Ref::new(&self.node().counter)
    }

    /// Mark an uninterruptible operation, connection teardown waits for it.
    pub fn block(&self) -> Block {
        Block::new(&self.node().counter)
    }

    /// Waker that posts this request again, usable from any thread.
    pub fn waker(&self) -> Waker {
        Waker::new(self.session.wake_tx.clone(), self.id, self.hold())
    }

    // ===== Context =====

    pub fn ctx<T: Any + Send>(&self) -> Option<&T> {
        self.node().ctx.get(&TypeId::of::<T>())?.downcast_ref()
    }

    pub fn ctx_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.node_mut().ctx.get_mut(&TypeId::of::<T>())?.downcast_mut()
    }

    pub fn set_ctx<T: Any + Send>(&mut self, value: T) {
        self.node_mut().ctx.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn remove_ctx<T: Any + Send>(&mut self) -> Option<T> {
        let value = self.node_mut().ctx.remove(&TypeId::of::<T>())?;
        value.downcast().ok().map(|value| *value)
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("uri", &self.uri())
            .finish_non_exhaustive()
    }
}
