//! Generation checked slab.
//!
//! Slots are reused after removal, a stale [`Key`] whose slot was reused does not resolve.
use std::marker::PhantomData;

/// Index into a [`Slab`].
pub struct Key<T> {
    index: u32,
    generation: u32,
    _p: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    #[inline]
    pub(crate) const fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Clone for Key<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> { }

impl<T> PartialEq for Key<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Key<T> { }

impl<T> std::hash::Hash for Key<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> std::fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

// ===== Slab =====

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next: Option<u32> },
}

pub(crate) struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Option<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) const fn new() -> Self {
        Self { slots: Vec::new(), free: None, len: 0 }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn insert(&mut self, value: T) -> Key<T> {
        self.len += 1;

        if let Some(index) = self.free {
            let slot = &mut self.slots[index as usize];
            let Slot::Vacant { generation, next } = *slot else {
                unreachable!("free list points to an occupied slot")
            };
            let generation = generation.wrapping_add(1);
            self.free = next;
            *slot = Slot::Occupied { generation, value };
            return Key { index, generation, _p: PhantomData };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { generation: 0, value });
        Key { index, generation: 0, _p: PhantomData }
    }

    pub(crate) fn get(&self, key: Key<T>) -> Option<&T> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, key: Key<T>) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn contains(&self, key: Key<T>) -> bool {
        self.get(key).is_some()
    }

    pub(crate) fn remove(&mut self, key: Key<T>) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let vacant = Slot::Vacant { generation: key.generation, next: self.free };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, vacant) else {
            unreachable!()
        };
        self.free = Some(key.index);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = Key<T>> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, .. } => Some(Key {
                index: index as u32,
                generation: *generation,
                _p: PhantomData,
            }),
            Slot::Vacant { .. } => None,
        })
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        })
    }

    /// Remove every value, keeping the allocation.
    ///
    /// Generations keep counting so keys handed out before stay stale.
    pub(crate) fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = *slot {
                *slot = Slot::Vacant { generation, next: self.free };
                self.free = Some(index as u32);
            }
        }
        self.len = 0;
    }
}

impl<T> std::ops::Index<Key<T>> for Slab<T> {
    type Output = T;

    /// # Panics
    ///
    /// Panics if `key` is stale.
    #[inline]
    fn index(&self, key: Key<T>) -> &Self::Output {
        match self.get(key) {
            Some(value) => value,
            None => panic!("stale slab key {key:?}"),
        }
    }
}

impl<T> std::ops::IndexMut<Key<T>> for Slab<T> {
    #[inline]
    fn index_mut(&mut self, key: Key<T>) -> &mut Self::Output {
        match self.get_mut(key) {
            Some(value) => value,
            None => panic!("stale slab key {key:?}"),
        }
    }
}

impl<T> std::fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab").field("len", &self.len).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stale_keys_do_not_resolve() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.remove(a), None);

        let c = slab.insert("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.get(c), Some(&"c"));
        assert_eq!(slab.get(b), Some(&"b"));
    }

    #[test]
    fn clear_invalidates() {
        let mut slab = Slab::new();
        let a = slab.insert(1);
        let _ = slab.insert(2);
        slab.clear();
        assert!(slab.is_empty());
        assert!(!slab.contains(a));

        let b = slab.insert(3);
        assert!(slab.contains(b));
        assert_eq!(slab.keys().count(), 1);
    }
}
