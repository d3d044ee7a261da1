use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared open file.
///
/// Identity is per open, two handles of the same path opened separately are distinct files
/// and are never coalesced into one send.
#[derive(Clone)]
pub struct File {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    path: PathBuf,
    file: fs::File,
    len: u64,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

impl File {
    /// Open a file for reading.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::from_parts(path.to_path_buf(), file, len))
    }

    pub(crate) fn from_parts(path: PathBuf, file: fs::File, len: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                path,
                file,
                len,
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// File length at open time.
    #[inline]
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    #[inline]
    pub fn same_file(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read at `offset` into `buf`, returns bytes read.
    ///
    /// Seeks the shared descriptor, the engine is single threaded per connection.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = &self.inner.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset)? {
                0 => return Err(io::ErrorKind::UnexpectedEof.into()),
                n => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

// ===== FileRegion =====

/// File resident window.
///
/// `start <= pos <= last <= end`, `pos..last` is the content still to be consumed.
#[derive(Debug, Clone)]
pub struct FileRegion {
    pub(crate) file: File,
    pub(crate) start: u64,
    pub(crate) pos: u64,
    pub(crate) last: u64,
    pub(crate) end: u64,
}

impl FileRegion {
    /// Region covering `range` of `file`.
    ///
    /// The range is clamped to the file length, an inverted range is empty.
    pub fn new(file: File, range: std::ops::Range<u64>) -> Self {
        let end = range.end.min(file.len());
        let start = range.start.min(end);
        Self {
            file,
            start,
            pos: start,
            last: end,
            end,
        }
    }

    /// Region covering the whole file.
    pub fn whole(file: File) -> Self {
        let len = file.len();
        Self::new(file, 0..len)
    }

    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn last(&self) -> u64 {
        self.last
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.last - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.last
    }
}
