use bytes::{BufMut, Bytes, BytesMut};

use super::{FileRegion, Flags};

/// Identity of the stage that owns a buffer.
///
/// Used when recycling, buffers are only returned to the free list of the owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tag(&'static str);

impl Tag {
    pub const NONE: Self = Self("");

    #[inline]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

/// Memory backing.
#[derive(Debug, Default)]
enum Storage {
    #[default]
    None,
    /// Fixed extent, writable by the owner.
    Mutable(BytesMut),
    /// Shared by reference count, never mutated.
    Shared(Bytes),
}

/// Buffer descriptor.
///
/// Describes a window of bytes in memory, in a file region, or both. A buffer with neither
/// and only `last`, `flush` or `sync` set is a sentinel, it carries no bytes only a signal.
///
/// `0 <= pos <= last <= end`, only `pos..last` is content. Consuming a buffer advances
/// `pos`, recycling resets the window to the start and never shrinks the extent.
#[derive(Debug, Default)]
pub struct Buf {
    storage: Storage,
    pos: usize,
    last: usize,
    end: usize,
    file: Option<FileRegion>,
    flags: Flags,
    tag: Tag,
}

impl Buf {
    /// Empty descriptor without storage.
    #[inline]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Payload-less buffer carrying control `flags`.
    pub fn sentinel(flags: Flags) -> Self {
        Self {
            flags: flags.difference(Flags::MUTABLE | Flags::READONLY | Flags::MAPPED | Flags::IN_FILE),
            ..Self::default()
        }
    }

    /// Writable buffer with a fixed extent of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Storage::Mutable(BytesMut::with_capacity(capacity)),
            end: capacity,
            flags: Flags::MUTABLE,
            ..Self::default()
        }
    }

    /// Writable buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            storage: Storage::Mutable(BytesMut::zeroed(len)),
            last: len,
            end: len,
            flags: Flags::MUTABLE,
            ..Self::default()
        }
    }

    /// Read only buffer sharing `bytes`.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            last: bytes.len(),
            end: bytes.len(),
            storage: Storage::Shared(bytes),
            flags: Flags::READONLY,
            ..Self::default()
        }
    }

    /// File resident buffer.
    pub fn from_file(region: FileRegion) -> Self {
        Self {
            file: Some(region),
            flags: Flags::IN_FILE,
            ..Self::default()
        }
    }

    // ===== Flags =====

    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    #[inline]
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags.insert(flags);
    }

    #[inline]
    pub fn clear_flags(&mut self, flags: Flags) {
        self.flags.remove(flags);
    }

    /// Builder style [`Buf::set_flags`].
    #[inline]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.set_flags(flags);
        self
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn set_tag(&mut self, tag: Tag) {
        self.tag = tag;
    }

    #[inline]
    pub fn in_memory(&self) -> bool {
        self.flags.in_memory()
    }

    #[inline]
    pub fn in_file(&self) -> bool {
        self.flags.contains(Flags::IN_FILE)
    }

    /// No payload, only control flags.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.flags.is_control() && !self.in_memory() && !self.in_file()
    }

    // ===== Window =====

    /// Bytes left to consume.
    ///
    /// Memory takes precedence when a buffer is both in memory and in a file.
    pub fn size(&self) -> u64 {
        if self.in_memory() {
            (self.last - self.pos) as u64
        } else if let Some(file) = self.file.as_ref().filter(|_| self.in_file()) {
            file.len()
        } else {
            0
        }
    }

    #[inline]
    pub fn is_consumed(&self) -> bool {
        self.size() == 0
    }

    /// Allocated memory extent.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end
    }

    /// Free space of a writable buffer.
    pub fn spare(&self) -> usize {
        match &self.storage {
            Storage::Mutable(bytes) => self.end - bytes.len(),
            _ => 0,
        }
    }

    /// Memory content still to be consumed.
    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::None => &[],
            Storage::Mutable(bytes) => &bytes[self.pos..self.last],
            Storage::Shared(bytes) => &bytes[self.pos..self.last],
        }
    }

    #[inline]
    pub fn file_region(&self) -> Option<&FileRegion> {
        self.file.as_ref()
    }

    /// Append into a writable buffer, returns bytes copied.
    ///
    /// Never grows the extent, copies at most [`Buf::spare`] bytes.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let Storage::Mutable(bytes) = &mut self.storage else {
            return 0;
        };
        let n = data.len().min(self.end - bytes.len());
        bytes.put_slice(&data[..n]);
        self.last = bytes.len();
        n
    }

    /// Consume `n` bytes of the window.
    pub fn advance(&mut self, n: u64) {
        if self.in_memory() {
            debug_assert!(n <= (self.last - self.pos) as u64);
            self.pos += n as usize;
        }
        if self.in_file() {
            if let Some(file) = &mut self.file {
                debug_assert!(n <= file.len());
                file.pos += n;
            }
        }
    }

    /// Consume the whole window.
    pub fn consume(&mut self) {
        if self.in_memory() {
            self.pos = self.last;
        }
        if let Some(file) = &mut self.file {
            file.pos = file.last;
        }
    }

    /// Reset the window to the start of the extent for reuse.
    pub fn reset(&mut self) {
        if let Storage::Mutable(bytes) = &mut self.storage {
            bytes.clear();
        }
        self.pos = 0;
        self.last = 0;
        if let Some(file) = &mut self.file {
            file.pos = file.start;
            file.last = file.start;
        }
    }

    /// Copy of the remaining memory content.
    pub(crate) fn to_bytes(&self) -> Bytes {
        match &self.storage {
            Storage::Shared(bytes) => bytes.slice(self.pos..self.last),
            _ => Bytes::copy_from_slice(self.as_slice()),
        }
    }
}
