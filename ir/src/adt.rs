use bitvec::vec::BitVec;
use cranelift_entity::EntityRef;

/// A dense set of entities, backed by a bit vector indexed by entity number
#[derive(Clone, PartialEq, Eq)]
pub struct EntitySet<K> {
    bits: BitVec,
    _marker: core::marker::PhantomData<K>,
}

impl<K> Default for EntitySet<K> {
    fn default() -> Self {
        Self {
            bits: BitVec::new(),
            _marker: core::marker::PhantomData,
        }
    }
}

impl<K: EntityRef> EntitySet<K> {
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
            _marker: core::marker::PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, capacity),
            _marker: core::marker::PhantomData,
        }
    }

    #[inline]
    pub fn contains(&self, key: K) -> bool {
        self.bits.get(key.index()).is_some_and(|bit| *bit)
    }

    /// Insert `key`, returning true if it was not already present
    pub fn insert(&mut self, key: K) -> bool {
        let index = key.index();
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        !self.bits.replace(index, true)
    }

    pub fn remove(&mut self, key: K) -> bool {
        let index = key.index();
        if index >= self.bits.len() {
            return false;
        }
        self.bits.replace(index, false)
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.bits.iter_ones().map(K::new)
    }
}

impl<K: EntityRef + core::fmt::Debug> core::fmt::Debug for EntitySet<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K: EntityRef> FromIterator<K> for EntitySet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = Self::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<K: EntityRef> Extend<K> for EntitySet<K> {
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

/// A set of nodes
pub type NodeSet = EntitySet<crate::Node>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    #[test]
    fn insert_grows() {
        let mut set = NodeSet::new();
        assert!(set.insert(Node::new(70)));
        assert!(!set.insert(Node::new(70)));
        assert!(set.contains(Node::new(70)));
        assert!(!set.contains(Node::new(3)));
        assert_eq!(set.iter().collect::<alloc::vec::Vec<_>>(), [Node::new(70)]);
        assert!(set.remove(Node::new(70)));
        assert!(set.is_empty());
    }
}
