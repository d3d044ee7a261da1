//! Request reference counting.
//!
//! Every pending operation of a request holds a [`Ref`], dropping it releases the hold. A
//! request is torn down only when no [`Ref`] and no [`Block`] is alive.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Counter {
    count: AtomicU32,
    blocked: AtomicU32,
}

impl Counter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::default()
    }

    #[inline]
    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn blocked(&self) -> u32 {
        self.blocked.load(Ordering::Acquire)
    }

    /// No hold of any kind is alive.
    #[inline]
    pub(crate) fn is_released(&self) -> bool {
        self.count() == 0 && self.blocked() == 0
    }
}

/// Hold on a request, keeps it from being torn down.
///
/// Cloning takes another hold.
#[derive(Debug)]
pub struct Ref {
    counter: Arc<Counter>,
}

impl Ref {
    pub(crate) fn new(counter: &Arc<Counter>) -> Self {
        counter.count.fetch_add(1, Ordering::AcqRel);
        Self { counter: counter.clone() }
    }
}

impl Clone for Ref {
    fn clone(&self) -> Self {
        Self::new(&self.counter)
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        let prev = self.counter.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "request reference count underflow");
    }
}

/// Uninterruptible operation in flight, connection cleanup waits for it.
#[derive(Debug)]
pub struct Block {
    counter: Arc<Counter>,
}

impl Block {
    pub(crate) fn new(counter: &Arc<Counter>) -> Self {
        counter.blocked.fetch_add(1, Ordering::AcqRel);
        Self { counter: counter.clone() }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let prev = self.counter.blocked.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "request blocked count underflow");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_hold_has_one_release() {
        let counter = Counter::new();
        let a = Ref::new(&counter);
        let b = a.clone();
        assert_eq!(counter.count(), 2);

        let block = Block::new(&counter);
        drop(a);
        drop(b);
        assert_eq!(counter.count(), 0);
        assert!(!counter.is_released());

        // holds can leave the connection thread
        std::thread::spawn(move || drop(block)).join().unwrap();
        assert!(counter.is_released());
    }
}
