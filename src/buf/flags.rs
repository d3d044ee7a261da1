/// Buffer flags.
///
/// ```text
/// [ .., recycled, sync, flush, last_in_chain, last, in_file, mapped, readonly, mutable ]
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Self = Self(0x000);
    /// Memory content may be changed by filters.
    pub const MUTABLE: Self = Self(0x001);
    /// Memory content must not be changed.
    pub const READONLY: Self = Self(0x002);
    /// Memory is a mapping of a file.
    pub const MAPPED: Self = Self(0x004);
    /// Content lives in a file region.
    pub const IN_FILE: Self = Self(0x008);
    /// Final buffer of the whole response.
    pub const LAST: Self = Self(0x010);
    /// Final buffer of the producing request.
    pub const LAST_IN_CHAIN: Self = Self(0x020);
    /// Pending output must be sent now.
    pub const FLUSH: Self = Self(0x040);
    /// Synchronization point without payload semantics.
    pub const SYNC: Self = Self(0x080);
    /// Producer wants the buffer back soon, implies flush.
    pub const RECYCLED: Self = Self(0x100);

    const MEMORY_MASK: u16 = Self::MUTABLE.0 | Self::READONLY.0 | Self::MAPPED.0;
    const CONTROL_MASK: u16 = Self::LAST.0 | Self::FLUSH.0 | Self::SYNC.0;

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Any memory kind is set.
    #[inline]
    pub const fn in_memory(self) -> bool {
        self.0 & Self::MEMORY_MASK != 0
    }

    /// Any of `last`, `flush` or `sync` is set.
    #[inline]
    pub const fn is_control(self) -> bool {
        self.0 & Self::CONTROL_MASK != 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(Flags, &str); 9] = [
            (Flags::MUTABLE, "mutable"),
            (Flags::READONLY, "readonly"),
            (Flags::MAPPED, "mapped"),
            (Flags::IN_FILE, "in_file"),
            (Flags::LAST, "last"),
            (Flags::LAST_IN_CHAIN, "last_in_chain"),
            (Flags::FLUSH, "flush"),
            (Flags::SYNC, "sync"),
            (Flags::RECYCLED, "recycled"),
        ];

        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}
