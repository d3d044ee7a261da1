//! Buffer chains.
//!
//! A [`Chain`] is a singly linked sequence of buffer references handed between pipeline
//! stages. Links live in the [`Pool`], the chain value only owns its links, never the
//! buffers: one buffer may be referenced from several chains at once.
//!
//! Freed links go back to the pool free list and are reused by [`Pool::alloc_link`].
use crate::buf::Tag;
use crate::error::AllocError;
use crate::pool::{BufId, Pool};

/// Page size used to align coalesced file ranges.
pub(crate) const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LinkId(u32);

#[derive(Debug)]
pub(crate) struct Link {
    buf: Option<BufId>,
    next: Option<LinkId>,
}

/// Owned sequence of chain links.
///
/// Dropping a non empty chain leaks its links until the pool is reset, hand it to
/// [`Pool::free_chain`] instead.
#[derive(Debug, Default)]
pub struct Chain {
    head: Option<LinkId>,
    tail: Option<LinkId>,
}

impl Chain {
    #[inline]
    pub const fn new() -> Self {
        Self { head: None, tail: None }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<LinkId> {
        self.head
    }
}

// ===== Links =====

impl Pool {
    /// Take a link from the free list, or allocate one.
    pub(crate) fn alloc_link(&mut self, buf: BufId) -> Result<LinkId, AllocError> {
        if let Some(index) = self.free_links {
            let link = &mut self.links[index as usize];
            self.free_links = link.next.map(|next| next.0);
            link.buf = Some(buf);
            link.next = None;
            return Ok(LinkId(index));
        }

        self.charge(std::mem::size_of::<Link>())?;
        let index = self.links.len() as u32;
        self.links.push(Link { buf: Some(buf), next: None });
        Ok(LinkId(index))
    }

    /// Return a link to the free list, the buffer is untouched.
    pub(crate) fn free_link(&mut self, id: LinkId) {
        let link = &mut self.links[id.0 as usize];
        debug_assert!(link.buf.is_some(), "double free of chain link");
        link.buf = None;
        link.next = self.free_links.map(LinkId);
        self.free_links = Some(id.0);
    }

    #[inline]
    pub(crate) fn link_buf(&self, id: LinkId) -> BufId {
        match self.links[id.0 as usize].buf {
            Some(buf) => buf,
            None => panic!("use of freed chain link"),
        }
    }

    #[inline]
    pub(crate) fn link_next(&self, id: LinkId) -> Option<LinkId> {
        self.links[id.0 as usize].next
    }

    /// Number of links on the free list.
    pub fn free_link_count(&self) -> usize {
        let mut count = 0;
        let mut next = self.free_links;
        while let Some(index) = next {
            count += 1;
            next = self.links[index as usize].next.map(|l| l.0);
        }
        count
    }
}

// ===== Chain Operations =====

impl Pool {
    /// Chain of a single buffer.
    pub fn chain(&mut self, buf: BufId) -> Result<Chain, AllocError> {
        let mut chain = Chain::new();
        self.push(&mut chain, buf)?;
        Ok(chain)
    }

    /// Allocate every descriptor of `bufs` into one chain.
    pub fn chain_from<I>(&mut self, bufs: I) -> Result<Chain, AllocError>
    where
        I: IntoIterator<Item = crate::buf::Buf>,
    {
        let mut chain = Chain::new();
        for buf in bufs {
            if let Err(err) = self.push_new(&mut chain, buf) {
                self.discard_chain(chain);
                return Err(err);
            }
        }
        Ok(chain)
    }

    /// Take ownership of `buf` and append it, nothing stays allocated on failure.
    pub fn push_new(&mut self, chain: &mut Chain, buf: crate::buf::Buf) -> Result<BufId, AllocError> {
        let id = self.alloc(buf)?;
        if let Err(err) = self.push(chain, id) {
            self.free(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Append a buffer reference.
    pub fn push(&mut self, chain: &mut Chain, buf: BufId) -> Result<(), AllocError> {
        let link = self.alloc_link(buf)?;
        match chain.tail {
            Some(tail) => self.links[tail.0 as usize].next = Some(link),
            None => chain.head = Some(link),
        }
        chain.tail = Some(link);
        Ok(())
    }

    /// Move every link of `other` to the end of `chain`.
    pub fn append(&mut self, chain: &mut Chain, other: Chain) {
        let Some(head) = other.head else {
            return;
        };
        match chain.tail {
            Some(tail) => self.links[tail.0 as usize].next = Some(head),
            None => chain.head = Some(head),
        }
        chain.tail = other.tail;
    }

    /// Detach the first buffer reference, its link is freed.
    pub fn pop_front(&mut self, chain: &mut Chain) -> Option<BufId> {
        let head = chain.head?;
        let buf = self.link_buf(head);
        chain.head = self.link_next(head);
        if chain.head.is_none() {
            chain.tail = None;
        }
        self.free_link(head);
        Some(buf)
    }

    /// Free every link of `chain`, buffers are untouched.
    pub fn free_chain(&mut self, mut chain: Chain) {
        while self.pop_front(&mut chain).is_some() { }
    }

    /// Free every link of `chain` together with the buffers it references.
    pub fn discard_chain(&mut self, mut chain: Chain) {
        while let Some(buf) = self.pop_front(&mut chain) {
            self.free(buf);
        }
    }

    /// Iterate buffer references of `chain`.
    pub fn iter<'a>(&'a self, chain: &'a Chain) -> Iter<'a> {
        Iter { pool: self, next: chain.head }
    }

    /// Visit every buffer of `chain` mutably.
    pub fn for_each_mut<F>(&mut self, chain: &Chain, mut f: F)
    where
        F: FnMut(&mut crate::buf::Buf),
    {
        let mut next = chain.head;
        while let Some(link) = next {
            next = self.link_next(link);
            let id = self.link_buf(link);
            f(&mut self[id]);
        }
    }

    /// Total bytes left to consume in `chain`.
    pub fn chain_size(&self, chain: &Chain) -> u64 {
        self.iter(chain).map(|id| self[id].size()).sum()
    }

    /// Account `sent` bytes as consumed.
    ///
    /// Buffer windows are advanced in place. Leading links that are fully consumed or are
    /// sentinels are freed, `chain` is left starting at the first unsent byte.
    pub fn update_sent(&mut self, chain: &mut Chain, mut sent: u64) {
        let mut next = chain.head;
        while let Some(link) = next {
            next = self.link_next(link);
            let id = self.link_buf(link);
            let buf = &mut self[id];

            if buf.is_sentinel() {
                continue;
            }
            if sent == 0 {
                break;
            }

            let size = buf.size();
            if sent >= size {
                sent -= size;
                buf.consume();
                continue;
            }

            buf.advance(sent);
            break;
        }

        while let Some(head) = chain.head {
            let buf = &self[self.link_buf(head)];
            if !buf.is_sentinel() && !buf.is_consumed() {
                break;
            }
            self.pop_front(chain);
        }
    }

    /// Move consumed buffers from `busy` to `free`.
    ///
    /// `out` is appended to `busy` first. Busy buffers are released from the front until the
    /// first one still holding content, whatever its owner. Released buffers owned by `tag`
    /// are reset and go to `free` for reuse by the owner, links of released foreign buffers
    /// go back to the pool free list.
    pub fn update_chains(&mut self, free: &mut Chain, busy: &mut Chain, out: &mut Chain, tag: Tag) {
        self.append(busy, std::mem::take(out));

        while let Some(head) = busy.head {
            let id = self.link_buf(head);

            if !self[id].is_consumed() {
                break;
            }

            if self[id].tag() != tag {
                self.pop_front(busy);
                continue;
            }

            self[id].reset();

            busy.head = self.link_next(head);
            if busy.head.is_none() {
                busy.tail = None;
            }

            self.links[head.0 as usize].next = free.head;
            if free.head.is_none() {
                free.tail = Some(head);
            }
            free.head = Some(head);
        }
    }

    /// Reuse a buffer from `free`, or allocate one of `size` bytes extent owned by `tag`.
    pub fn get_free_buf(&mut self, free: &mut Chain, size: usize, tag: Tag) -> Result<BufId, AllocError> {
        if let Some(id) = self.pop_front(free) {
            return Ok(id);
        }
        let id = self.allocate(size)?;
        self[id].set_tag(tag);
        Ok(id)
    }

    /// Length of the file range starting at `link` that can be sent in one call.
    ///
    /// Walks following links while they continue the same file contiguously, up to `limit`
    /// bytes. When the limit cuts a buffer, the range end is rounded up to a page boundary if
    /// that stays within the buffer. Returns the total and the first link not covered.
    pub(crate) fn coalesce_file(&self, link: LinkId, limit: u64) -> (u64, Option<LinkId>) {
        let mut total = 0;
        let mut cur = Some(link);
        // file and end offset of the previous range
        let mut prev: Option<(&crate::buf::File, u64)> = None;

        while let Some(link) = cur {
            let buf = &self[self.link_buf(link)];
            let Some(region) = buf.file_region().filter(|_| buf.in_file() && !buf.in_memory()) else {
                break;
            };
            if let Some((file, end)) = prev {
                if total >= limit || !region.file().same_file(file) || region.pos() != end {
                    break;
                }
            }

            let size = region.len();
            if size > limit - total {
                let mut size = limit - total;
                let aligned = (region.pos() + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                if aligned <= region.last() {
                    size = aligned - region.pos();
                }
                // the cut buffer stays at the head of the remainder
                return (total + size, Some(link));
            }

            total += size;
            prev = Some((region.file(), region.last()));
            cur = self.link_next(link);
        }

        (total, cur)
    }
}

/// Iterator of buffer references in a chain.
#[derive(Debug)]
pub struct Iter<'a> {
    pool: &'a Pool,
    next: Option<LinkId>,
}

impl Iterator for Iter<'_> {
    type Item = BufId;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next?;
        self.next = self.pool.link_next(link);
        Some(self.pool.link_buf(link))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::buf::{Buf, File, FileRegion, Flags};

    fn contents(pool: &Pool, chain: &Chain) -> Vec<u8> {
        pool.iter(chain).flat_map(|id| pool[id].as_slice().to_vec()).collect()
    }

    #[test]
    fn links_are_recycled() {
        let mut pool = Pool::new(0);
        let chain = pool
            .chain_from([Buf::from_bytes(&b"ab"[..]), Buf::from_bytes(&b"cd"[..])])
            .unwrap();
        assert_eq!(pool.chain_size(&chain), 4);
        assert_eq!(pool.links.len(), 2);

        pool.free_chain(chain);
        assert_eq!(pool.free_link_count(), 2);

        let id = pool.alloc(Buf::from_bytes(&b"ef"[..])).unwrap();
        let mut chain = pool.chain(id).unwrap();
        pool.push(&mut chain, id).unwrap();
        assert_eq!(pool.links.len(), 2, "links reused from the free list");
        assert_eq!(contents(&pool, &chain), b"efef", "one buffer in two links");
        pool.free_chain(chain);
    }

    #[test]
    fn failed_chain_from_frees_everything() {
        let buf = std::mem::size_of::<Buf>();
        let link = std::mem::size_of::<Link>();
        // room for two linked buffers and a third descriptor without its link
        let mut pool = Pool::new(2 * (buf + link) + buf);

        let bufs = [b"ab", b"cd", b"ef"].map(|b| Buf::from_bytes(bytes::Bytes::from_static(b)));
        let err = pool.chain_from(bufs).unwrap_err();
        assert_eq!(err.requested, link);

        // links stay on the free list, every buffer is returned to the budget
        assert_eq!(pool.free_link_count(), 2);
        assert_eq!(pool.used(), 2 * link);

        let chain = pool.chain_from([Buf::from_bytes(&b"gh"[..])]).unwrap();
        assert_eq!(contents(&pool, &chain), b"gh");
        pool.discard_chain(chain);
        assert_eq!(pool.used(), 2 * link);
    }

    #[test]
    fn append_and_pop() {
        let mut pool = Pool::new(0);
        let mut a = pool.chain_from([Buf::from_bytes(&b"1"[..])]).unwrap();
        let b = pool.chain_from([Buf::from_bytes(&b"2"[..]), Buf::from_bytes(&b"3"[..])]).unwrap();
        pool.append(&mut a, b);
        pool.append(&mut a, Chain::new());
        assert_eq!(contents(&pool, &a), b"123");

        let first = pool.pop_front(&mut a).unwrap();
        assert_eq!(pool[first].as_slice(), b"1");
        let tail = pool.alloc(Buf::from_bytes(&b"4"[..])).unwrap();
        pool.push(&mut a, tail).unwrap();
        assert_eq!(contents(&pool, &a), b"234");

        pool.pop_front(&mut a);
        pool.pop_front(&mut a);
        pool.pop_front(&mut a);
        assert!(a.is_empty());
        assert!(pool.pop_front(&mut a).is_none());
    }

    #[test]
    fn update_sent_partial() {
        let mut pool = Pool::new(0);
        let mut chain = pool
            .chain_from([
                Buf::from_bytes(&b"hello"[..]),
                Buf::sentinel(Flags::FLUSH),
                Buf::from_bytes(&b"world"[..]),
                Buf::sentinel(Flags::LAST),
            ])
            .unwrap();

        pool.update_sent(&mut chain, 3);
        assert_eq!(contents(&pool, &chain), b"loworld");

        // boundary, the flush sentinel between goes away
        pool.update_sent(&mut chain, 2);
        assert_eq!(contents(&pool, &chain), b"world");
        assert_eq!(pool.iter(&chain).count(), 2);

        pool.update_sent(&mut chain, 5);
        assert!(chain.is_empty(), "trailing sentinel is released with the last byte");
    }

    #[test]
    fn update_chains_keeps_unsent_foreign_buffer() {
        const OWN: Tag = Tag::new("own");

        let mut pool = Pool::new(0);
        let mut free = Chain::new();
        let mut busy = Chain::new();
        let mut out = Chain::new();

        let foreign = pool.alloc(Buf::from_bytes(&b"f"[..])).unwrap();
        pool.push(&mut out, foreign).unwrap();

        pool.update_chains(&mut free, &mut busy, &mut out, OWN);
        assert_eq!(pool.iter(&busy).collect::<Vec<_>>(), [foreign]);
        assert!(free.is_empty());

        let links = pool.free_link_count();
        pool[foreign].consume();
        pool.update_chains(&mut free, &mut busy, &mut out, OWN);
        assert!(busy.is_empty());
        assert!(free.is_empty(), "foreign buffers never reach the owner's free list");
        assert_eq!(pool.free_link_count(), links + 1);
    }

    #[test]
    fn update_chains_recycles_own_buffers() {
        const OWN: Tag = Tag::new("own");

        let mut pool = Pool::new(0);
        let mut free = Chain::new();
        let mut busy = Chain::new();

        let a = pool.get_free_buf(&mut free, 8, OWN).unwrap();
        pool[a].write(b"aaaa");
        let foreign = pool.alloc(Buf::from_bytes(&b"f"[..])).unwrap();
        let b = pool.get_free_buf(&mut free, 8, OWN).unwrap();
        pool[b].write(b"bb");

        let mut out = Chain::new();
        for id in [a, foreign, b] {
            pool.push(&mut out, id).unwrap();
        }

        // nothing consumed yet
        pool.update_chains(&mut free, &mut busy, &mut out, OWN);
        assert!(out.is_empty());
        assert!(free.is_empty());
        assert_eq!(pool.iter(&busy).count(), 3);

        pool[a].consume();
        pool.update_chains(&mut free, &mut busy, &mut out, OWN);
        assert_eq!(pool.iter(&free).collect::<Vec<_>>(), [a]);
        // the foreign buffer still holds content and keeps `b` behind it
        assert_eq!(pool.iter(&busy).collect::<Vec<_>>(), [foreign, b]);
        assert_eq!(pool[a].size(), 0);
        assert_eq!(pool[a].capacity(), 8);

        pool[foreign].consume();
        pool.update_chains(&mut free, &mut busy, &mut out, OWN);
        assert_eq!(pool.iter(&free).collect::<Vec<_>>(), [a]);
        assert_eq!(pool.iter(&busy).collect::<Vec<_>>(), [b]);

        let reused = pool.get_free_buf(&mut free, 8, OWN).unwrap();
        assert_eq!(reused, a);
        pool.free_chain(busy);
    }

    #[test]
    fn coalesce_contiguous_file_ranges() {
        let path = std::env::temp_dir().join(format!("weave-coalesce-{}", std::process::id()));
        std::fs::write(&path, vec![b'x'; 3 * PAGE_SIZE as usize]).unwrap();
        let file = File::open(&path).unwrap();
        let other = File::open(&path).unwrap();

        let mut pool = Pool::new(0);
        let chain = pool
            .chain_from([
                Buf::from_file(FileRegion::new(file.clone(), 0..100)),
                Buf::from_file(FileRegion::new(file.clone(), 100..5000)),
                Buf::from_file(FileRegion::new(file.clone(), 6000..7000)),
                Buf::from_file(FileRegion::new(other, 7000..8000)),
            ])
            .unwrap();
        let head = chain.head().unwrap();

        // gap at 5000..6000 stops the range
        let (total, next) = pool.coalesce_file(head, u64::MAX);
        assert_eq!(total, 5000);
        assert_eq!(next.map(|l| pool[pool.link_buf(l)].file_region().unwrap().pos()), Some(6000));

        // cut inside the second buffer, rounded up to a page boundary
        let (total, next) = pool.coalesce_file(head, 1000);
        assert_eq!(total, PAGE_SIZE);
        assert_eq!(next, pool.link_next(head));

        // a different open of the same path is a different file
        let third = pool.link_next(pool.link_next(head).unwrap()).unwrap();
        let (total, next) = pool.coalesce_file(third, u64::MAX);
        assert_eq!(total, 1000);
        assert!(next.is_some());

        pool.free_chain(chain);
        std::fs::remove_file(&path).ok();
    }
}
