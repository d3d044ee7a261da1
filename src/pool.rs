//! Connection arena.
//!
//! Owns every buffer descriptor and chain link of a connection. Buffers and links are
//! referenced by index, released in bulk with [`Pool::reset`], and never shared across
//! connections.
use std::mem;
use std::ops::{Index, IndexMut};

use crate::buf::{Buf, Flags};
use crate::chain::Link;
use crate::error::AllocError;
use crate::log::debug;
use crate::slab::{Key, Slab};

/// Buffer handle, resolves only within the pool that allocated it.
pub type BufId = Key<Buf>;

type Cleanup = Box<dyn FnOnce() + Send>;

pub struct Pool {
    bufs: Slab<Buf>,
    pub(crate) links: Vec<Link>,
    pub(crate) free_links: Option<u32>,
    cleanups: Vec<Cleanup>,
    limit: usize,
    used: usize,
    destroyed: bool,
}

impl Pool {
    /// Create pool with memory budget of `limit` bytes, `0` is unbounded.
    pub fn new(limit: usize) -> Self {
        Self {
            bufs: Slab::new(),
            links: Vec::new(),
            free_links: None,
            cleanups: Vec::new(),
            limit,
            used: 0,
            destroyed: false,
        }
    }

    /// Bytes charged against the budget.
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn charge(&mut self, size: usize) -> Result<(), AllocError> {
        let available = match (self.destroyed, self.limit) {
            (true, _) => 0,
            (false, 0) => usize::MAX,
            (false, limit) => limit.saturating_sub(self.used),
        };
        if size > available {
            return Err(AllocError { requested: size, available });
        }
        self.used += size;
        Ok(())
    }

    fn credit(&mut self, size: usize) {
        self.used = self.used.saturating_sub(size);
    }

    fn cost(buf: &Buf) -> usize {
        let owned = if buf.flags().contains(Flags::MUTABLE) { buf.capacity() } else { 0 };
        mem::size_of::<Buf>() + owned
    }

    // ===== Buffers =====

    /// Take ownership of a descriptor.
    pub fn alloc(&mut self, buf: Buf) -> Result<BufId, AllocError> {
        self.charge(Self::cost(&buf))?;
        Ok(self.bufs.insert(buf))
    }

    /// Allocate a writable buffer of `size` bytes extent.
    pub fn allocate(&mut self, size: usize) -> Result<BufId, AllocError> {
        self.alloc(Buf::with_capacity(size))
    }

    /// Allocate a writable buffer of `size` zero bytes.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<BufId, AllocError> {
        self.alloc(Buf::zeroed(size))
    }

    /// Release a single buffer before the pool is reset.
    pub fn free(&mut self, id: BufId) -> Option<Buf> {
        let buf = self.bufs.remove(id)?;
        self.credit(Self::cost(&buf));
        Some(buf)
    }

    #[inline]
    pub fn get(&self, id: BufId) -> Option<&Buf> {
        self.bufs.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: BufId) -> Option<&mut Buf> {
        self.bufs.get_mut(id)
    }

    #[inline]
    pub fn contains(&self, id: BufId) -> bool {
        self.bufs.contains(id)
    }

    // ===== Lifecycle =====

    /// Register `f` to run when the pool is reset or destroyed.
    ///
    /// Cleanups run in reverse registration order.
    pub fn register_cleanup<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanups.push(Box::new(f));
    }

    /// Release everything, keeping allocations for reuse.
    ///
    /// Handles issued before are stale afterwards.
    pub fn reset(&mut self) {
        debug!("pool reset: {} buffers, {} links, {} bytes", self.bufs.len(), self.links.len(), self.used);
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
        self.bufs.clear();
        self.links.clear();
        self.free_links = None;
        self.used = 0;
    }

    /// Release everything, further allocations fail.
    pub fn destroy(&mut self) {
        self.reset();
        self.destroyed = true;
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Index<BufId> for Pool {
    type Output = Buf;

    /// # Panics
    ///
    /// Panics if `id` is stale.
    #[inline]
    fn index(&self, id: BufId) -> &Self::Output {
        match self.bufs.get(id) {
            Some(buf) => buf,
            None => panic!("stale buffer handle {id:?}"),
        }
    }
}

impl IndexMut<BufId> for Pool {
    #[inline]
    fn index_mut(&mut self, id: BufId) -> &mut Self::Output {
        match self.bufs.get_mut(id) {
            Some(buf) => buf,
            None => panic!("stale buffer handle {id:?}"),
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("bufs", &self.bufs.len())
            .field("links", &self.links.len())
            .field("used", &self.used)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn budget() {
        let mut pool = Pool::new(mem::size_of::<Buf>() * 2 + 100);
        let a = pool.allocate(100).unwrap();
        assert_eq!(pool[a].capacity(), 100);

        let err = pool.allocate(100).unwrap_err();
        assert_eq!(err.requested, mem::size_of::<Buf>() + 100);

        // shared payload is not charged
        let b = pool.alloc(Buf::from_bytes(vec![0u8; 4096])).unwrap();
        assert_eq!(pool[b].size(), 4096);

        pool.free(a);
        assert!(pool.get(a).is_none());
        assert!(pool.allocate(100).is_ok());
    }

    #[test]
    fn cleanup_order_and_reset() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pool = Pool::new(0);

        for i in 0..3 {
            let log = log.clone();
            pool.register_cleanup(move || log.lock().unwrap().push(i));
        }

        let id = pool.allocate_zeroed(8).unwrap();
        assert_eq!(pool[id].as_slice(), &[0; 8]);

        pool.reset();
        assert_eq!(*log.lock().unwrap(), [2, 1, 0]);
        assert!(!pool.contains(id));
        assert_eq!(pool.used(), 0);

        pool.destroy();
        assert!(pool.is_destroyed());
        assert!(pool.allocate(1).is_err());
    }
}
