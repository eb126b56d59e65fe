//! Fixed-depth trie over key bytes
//!
//! One key byte selects a child per level. With keys of `key_size` bytes
//! there are `key_size - 1` levels of inner nodes; the last key byte indexes
//! a 256-entry leaf of `ValueRecord`s. Nodes sit in two arenas and are
//! created the first time a path is touched. They are never freed.
//!
//! The trie does no locking of its own. Callers serialize access per key.

use crate::error::{TierError, TierResult};
use crate::record::ValueRecord;

const FANOUT: usize = 256;

/// Child slot value meaning "no child". Stored indices are offset by one.
const NO_CHILD: u32 = 0;

type Inner = Box<[u32; FANOUT]>;
type Leaf = Box<[ValueRecord]>;

pub struct TrieIndex {
    key_size: usize,
    /// `inner[0]` is the root when `key_size > 1`
    inner: Vec<Inner>,
    /// `leaves[0]` is the root when `key_size == 1`
    leaves: Vec<Leaf>,
}

fn new_inner() -> Inner {
    Box::new([NO_CHILD; FANOUT])
}

fn new_leaf() -> Leaf {
    (0..FANOUT).map(|_| ValueRecord::default()).collect()
}

impl TrieIndex {
    pub fn new(key_size: usize) -> Self {
        let key_size = key_size.max(1);
        let (inner, leaves) = if key_size == 1 {
            (Vec::new(), vec![new_leaf()])
        } else {
            (vec![new_inner()], Vec::new())
        };
        Self { key_size, inner, leaves }
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    fn check_key(&self, key: &[u8]) -> TierResult<()> {
        if key.len() != self.key_size {
            return Err(TierError::InvalidKeySize {
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }

    /// Walk to the leaf for `key`, creating missing nodes.
    fn leaf_for_mut(&mut self, key: &[u8]) -> usize {
        if self.key_size == 1 {
            return 0;
        }
        let last_inner = self.key_size - 2;
        let mut node = 0usize;
        for (depth, &byte) in key[..self.key_size - 1].iter().enumerate() {
            let mut slot = self.inner[node][byte as usize];
            if slot == NO_CHILD {
                slot = if depth == last_inner {
                    self.leaves.push(new_leaf());
                    self.leaves.len() as u32
                } else {
                    self.inner.push(new_inner());
                    self.inner.len() as u32
                };
                self.inner[node][byte as usize] = slot;
            }
            if depth == last_inner {
                return (slot - 1) as usize;
            }
            node = (slot - 1) as usize;
        }
        0
    }

    /// Walk to the leaf for `key` without creating anything.
    fn leaf_for(&self, key: &[u8]) -> Option<usize> {
        if self.key_size == 1 {
            return Some(0);
        }
        let last_inner = self.key_size - 2;
        let mut node = 0usize;
        for (depth, &byte) in key[..self.key_size - 1].iter().enumerate() {
            let slot = self.inner[node][byte as usize];
            if slot == NO_CHILD {
                return None;
            }
            if depth == last_inner {
                return Some((slot - 1) as usize);
            }
            node = (slot - 1) as usize;
        }
        None
    }

    /// The record for `key`. Fails only when the key has the wrong size.
    pub fn lookup(&mut self, key: &[u8]) -> TierResult<&mut ValueRecord> {
        self.check_key(key)?;
        let leaf = self.leaf_for_mut(key);
        let byte = key[self.key_size - 1] as usize;
        Ok(&mut self.leaves[leaf][byte])
    }

    /// Read-only lookup; `None` if the path was never populated.
    pub fn get(&self, key: &[u8]) -> TierResult<Option<&ValueRecord>> {
        self.check_key(key)?;
        Ok(self
            .leaf_for(key)
            .map(|leaf| &self.leaves[leaf][key[self.key_size - 1] as usize]))
    }

    /// Visit every record whose location is not EMPTY, with its key.
    pub fn for_each_occupied<F: FnMut(&[u8], &ValueRecord)>(&self, mut f: F) {
        let mut key = Vec::with_capacity(self.key_size);
        if self.key_size == 1 {
            self.visit_leaf(0, &mut key, &mut f);
        } else {
            self.visit_inner(0, 0, &mut key, &mut f);
        }
    }

    fn visit_inner<F: FnMut(&[u8], &ValueRecord)>(&self, node: usize, depth: usize, key: &mut Vec<u8>, f: &mut F) {
        let last_inner = self.key_size - 2;
        for (byte, &slot) in self.inner[node].iter().enumerate() {
            if slot == NO_CHILD {
                continue;
            }
            key.push(byte as u8);
            if depth == last_inner {
                self.visit_leaf((slot - 1) as usize, key, f);
            } else {
                self.visit_inner((slot - 1) as usize, depth + 1, key, f);
            }
            key.pop();
        }
    }

    fn visit_leaf<F: FnMut(&[u8], &ValueRecord)>(&self, leaf: usize, key: &mut Vec<u8>, f: &mut F) {
        for (byte, record) in self.leaves[leaf].iter().enumerate() {
            if record.location.is_empty() {
                continue;
            }
            key.push(byte as u8);
            f(key, record);
            key.pop();
        }
    }

    pub fn node_count(&self) -> usize {
        self.inner.len() + self.leaves.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Lba, LocationTag, ValueLocation};
    use proptest::prelude::*;

    #[test]
    fn test_missing_key_is_empty_not_error() {
        let mut trie = TrieIndex::new(4);
        let rec = trie.lookup(b"abcd").unwrap();
        assert_eq!(rec.tag(), LocationTag::Empty);
    }

    #[test]
    fn test_wrong_key_size() {
        let mut trie = TrieIndex::new(4);
        assert!(matches!(
            trie.lookup(b"abc"),
            Err(TierError::InvalidKeySize { expected: 4, actual: 3 })
        ));
        assert!(trie.get(b"abcde").is_err());
    }

    #[test]
    fn test_get_does_not_create_nodes() {
        let trie = TrieIndex::new(4);
        assert!(trie.get(b"wxyz").unwrap().is_none());
        assert_eq!(trie.node_count(), 1);
    }

    #[test]
    fn test_lookup_creates_path_once() {
        let mut trie = TrieIndex::new(3);
        trie.lookup(b"aaa").unwrap().location = ValueLocation::OnDisk(Lba(1));
        let after_first = trie.node_count();
        assert_eq!(after_first, 3); // root, one inner, one leaf

        // Same leaf, different last byte: no new nodes.
        trie.lookup(b"aab").unwrap();
        assert_eq!(trie.node_count(), after_first);

        assert_eq!(trie.get(b"aaa").unwrap().unwrap().location.lba(), Some(Lba(1)));
    }

    #[test]
    fn test_single_byte_keys() {
        let mut trie = TrieIndex::new(1);
        trie.lookup(&[9]).unwrap().location = ValueLocation::OnDisk(Lba(9));
        assert_eq!(trie.node_count(), 1);

        let mut seen = Vec::new();
        trie.for_each_occupied(|k, r| seen.push((k.to_vec(), r.location.lba())));
        assert_eq!(seen, vec![(vec![9], Some(Lba(9)))]);
    }

    #[test]
    fn test_iteration_reconstructs_keys() {
        let mut trie = TrieIndex::new(2);
        for (i, key) in [[0u8, 1], [0, 2], [255, 255]].iter().enumerate() {
            trie.lookup(key).unwrap().location = ValueLocation::OnDisk(Lba(i as u64));
        }
        // Touched but left empty; not reported.
        trie.lookup(&[7, 7]).unwrap();

        let mut keys = Vec::new();
        trie.for_each_occupied(|k, _| keys.push(k.to_vec()));
        assert_eq!(keys, vec![vec![0, 1], vec![0, 2], vec![255, 255]]);
    }

    proptest! {
        #[test]
        fn prop_lookup_matches_map(keys in proptest::collection::vec(proptest::array::uniform4(any::<u8>()), 1..64)) {
            let mut trie = TrieIndex::new(4);
            let mut model = std::collections::BTreeMap::new();
            for (i, key) in keys.iter().enumerate() {
                trie.lookup(key).unwrap().location = ValueLocation::OnDisk(Lba(i as u64));
                model.insert(key.to_vec(), i as u64);
            }
            for (key, lba) in &model {
                let rec = trie.get(key).unwrap().unwrap();
                prop_assert_eq!(rec.location.lba(), Some(Lba(*lba)));
            }
            let mut visited = Vec::new();
            trie.for_each_occupied(|k, _| visited.push(k.to_vec()));
            prop_assert_eq!(visited, model.keys().cloned().collect::<Vec<_>>());
        }
    }
}
