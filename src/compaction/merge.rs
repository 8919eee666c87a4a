//! Heap-based k-way merging iterator.
//!
//! Merges any number of internal iterators (table readers, memtable
//! snapshots) into one stream ordered by the internal-key comparator:
//! user keys ascending, ties by sequence descending. Exact internal-key
//! ties are broken by input index, so callers should order inputs newest
//! first.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::memtable::InternalKeyComparator;

/// Entry in the merge heap: one valid child iterator's current key.
struct MergeEntry {
    key: Vec<u8>,
    index: usize,
    comparator: InternalKeyComparator,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap; ties prefer the smaller input
        // index (newer data source)
        self.comparator
            .compare(&other.key, &self.key)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// K-way merge over internal iterators.
pub struct MergingIterator {
    children: Vec<Box<dyn InternalIterator>>,
    comparator: InternalKeyComparator,
    heap: BinaryHeap<MergeEntry>,
    current: Option<MergeEntry>,
}

impl MergingIterator {
    /// Builds a merger; inputs should be ordered newest first so exact
    /// internal-key ties resolve to the freshest source.
    pub fn new(
        children: Vec<Box<dyn InternalIterator>>,
        comparator: InternalKeyComparator,
    ) -> Self {
        Self { children, comparator, heap: BinaryHeap::new(), current: None }
    }

    fn push_child(&mut self, index: usize) {
        let child = &self.children[index];
        if child.valid() {
            self.heap.push(MergeEntry {
                key: child.key().to_vec(),
                index,
                comparator: self.comparator.clone(),
            });
        }
    }

    fn rebuild_heap(&mut self) {
        self.heap.clear();
        self.current = None;
        for index in 0..self.children.len() {
            self.push_child(index);
        }
        self.current = self.heap.pop();
    }
}

impl InternalIterator for MergingIterator {
    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.rebuild_heap();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.rebuild_heap();
    }

    fn next(&mut self) {
        if let Some(current) = self.current.take() {
            // The winning child is still parked on the yielded key
            self.children[current.index].next();
            self.push_child(current.index);
        }
        self.current = self.heap.pop();
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        &self.current.as_ref().expect("iterator not valid").key
    }

    fn value(&self) -> &[u8] {
        let current = self.current.as_ref().expect("iterator not valid");
        self.children[current.index].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::iterator::VecIterator;
    use crate::memtable::{InternalKey, ValueType};
    use std::sync::Arc;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn entry(user: &[u8], seq: u64, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (InternalKey::new(user.to_vec(), seq, ValueType::Value).encode(), value.to_vec())
    }

    fn vec_iter(mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Box<dyn InternalIterator> {
        let cmp = icmp();
        entries.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        Box::new(VecIterator::new(entries, icmp()))
    }

    fn drain(merger: &mut MergingIterator) -> Vec<(Vec<u8>, u64, Vec<u8>)> {
        let mut out = Vec::new();
        merger.seek_to_first();
        while merger.valid() {
            let key = InternalKey::decode(merger.key()).unwrap();
            out.push((key.user_key().to_vec(), key.sequence(), merger.value().to_vec()));
            merger.next();
        }
        out
    }

    #[test]
    fn test_merge_disjoint_inputs() {
        let mut merger = MergingIterator::new(
            vec![
                vec_iter(vec![entry(b"a", 1, b"1"), entry(b"c", 3, b"3")]),
                vec_iter(vec![entry(b"b", 2, b"2"), entry(b"d", 4, b"4")]),
            ],
            icmp(),
        );

        let keys: Vec<Vec<u8>> = drain(&mut merger).into_iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_merge_orders_versions_newest_first() {
        let mut merger = MergingIterator::new(
            vec![
                vec_iter(vec![entry(b"k", 5, b"newest")]),
                vec_iter(vec![entry(b"k", 3, b"middle"), entry(b"k", 1, b"oldest")]),
            ],
            icmp(),
        );

        let result = drain(&mut merger);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], (b"k".to_vec(), 5, b"newest".to_vec()));
        assert_eq!(result[1], (b"k".to_vec(), 3, b"middle".to_vec()));
        assert_eq!(result[2], (b"k".to_vec(), 1, b"oldest".to_vec()));
    }

    #[test]
    fn test_merge_empty_inputs() {
        let mut merger =
            MergingIterator::new(vec![vec_iter(vec![]), vec_iter(vec![entry(b"a", 1, b"v")])], icmp());
        let result = drain(&mut merger);
        assert_eq!(result.len(), 1);

        let mut empty = MergingIterator::new(vec![], icmp());
        empty.seek_to_first();
        assert!(!empty.valid());
    }

    #[test]
    fn test_merge_seek() {
        let mut merger = MergingIterator::new(
            vec![
                vec_iter(vec![entry(b"a", 1, b"1"), entry(b"c", 3, b"3")]),
                vec_iter(vec![entry(b"b", 2, b"2")]),
            ],
            icmp(),
        );

        merger.seek(&InternalKey::new(b"b".to_vec(), u64::MAX >> 8, ValueType::Value).encode());
        assert!(merger.valid());
        assert_eq!(InternalKey::decode(merger.key()).unwrap().user_key(), b"b");

        merger.next();
        assert_eq!(InternalKey::decode(merger.key()).unwrap().user_key(), b"c");
    }
}
