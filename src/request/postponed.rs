//! Postponement queue.
use std::collections::VecDeque;

use super::NodeId;
use crate::chain::Chain;
use crate::pool::Pool;

/// Queue entry, either output or the position of a subrequest.
#[derive(Debug)]
pub(crate) enum Entry {
    Data(Chain),
    Child(NodeId),
}

/// Output and subrequests of a request that cannot reach the connection yet, in the order
/// they were produced.
#[derive(Debug, Default)]
pub(crate) struct Postponed {
    entries: VecDeque<Entry>,
}

impl Postponed {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Append output, merged into a trailing data entry.
    pub(crate) fn push_data(&mut self, pool: &mut Pool, chain: Chain) {
        if chain.is_empty() {
            return;
        }
        match self.entries.back_mut() {
            Some(Entry::Data(tail)) => pool.append(tail, chain),
            _ => self.entries.push_back(Entry::Data(chain)),
        }
    }

    #[inline]
    pub(crate) fn push_child(&mut self, child: NodeId) {
        self.entries.push_back(Entry::Child(child));
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<Entry> {
        self.entries.pop_front()
    }

    /// Pop the head entry if it is the position of `child`.
    pub(crate) fn pop_child(&mut self, child: NodeId) -> bool {
        match self.entries.front() {
            Some(Entry::Child(id)) if *id == child => {
                self.entries.pop_front();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn has_child(&self) -> bool {
        self.entries.iter().any(|e| matches!(e, Entry::Child(_)))
    }

    /// Remove every entry, output links go back to the pool.
    ///
    /// Returns the subrequests that were queued.
    pub(crate) fn clear(&mut self, pool: &mut Pool) -> Vec<NodeId> {
        let mut children = Vec::new();
        for entry in self.entries.drain(..) {
            match entry {
                Entry::Data(chain) => pool.free_chain(chain),
                Entry::Child(id) => children.push(id),
            }
        }
        children
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buf::Buf;
    use crate::slab::Slab;

    #[test]
    fn adjacent_data_is_merged() {
        let mut pool = Pool::new(0);
        let mut nodes = Slab::new();
        let child: NodeId = nodes.insert(super::super::Node::new(String::new(), None, 0));

        let mut queue = Postponed::default();
        let a = pool.chain_from([Buf::from_bytes(&b"a"[..])]).unwrap();
        let b = pool.chain_from([Buf::from_bytes(&b"b"[..])]).unwrap();
        queue.push_data(&mut pool, a);
        queue.push_data(&mut pool, b);
        queue.push_data(&mut pool, Chain::new());
        assert_eq!(queue.len(), 1);

        queue.push_child(child);
        let c = pool.chain_from([Buf::from_bytes(&b"c"[..])]).unwrap();
        queue.push_data(&mut pool, c);
        assert_eq!(queue.len(), 3);
        assert!(queue.has_child());
        assert!(!queue.pop_child(child), "child is not at the head");

        let Some(Entry::Data(head)) = queue.pop_front() else { panic!("expected data") };
        assert_eq!(pool.chain_size(&head), 2);
        pool.free_chain(head);
        assert!(queue.pop_child(child));

        assert!(queue.clear(&mut pool).is_empty());
        assert!(queue.is_empty());
    }
}
