//! K-way merge of ordered child iterators.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crate::error::Result;
use crate::util::comparator::Comparator;

use super::Iter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges any number of ordered iterators into one ordered view.
///
/// Children are visited in caller order when keys tie, so callers
/// should pass newer sources first.
pub struct MergingIterator {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn Iter + Send>>,
    /// Index of the child the iterator is positioned on.
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    /// Merge `children` under the ordering of `cmp`.
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn Iter + Send>>) -> Self {
        Self {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key())
                        == CmpOrdering::Less
                    {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key())
                        == CmpOrdering::Greater
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl Iter for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        if self.direction != Direction::Forward {
            // All non-current children sit before `key()`; realign
            // them to the first entry after it.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == CmpOrdering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        if self.direction != Direction::Reverse {
            // All non-current children sit at or after `key()`;
            // realign them to the last entry before it.
            let key = self.children[current].key().to_vec();
            for i in 0..self.children.len() {
                if i == current {
                    continue;
                }
                let child = &mut self.children[i];
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key; step back
                    child.prev();
                } else {
                    // Everything in the child is < key
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.unwrap()].value()
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
    use crate::util::comparator::BytewiseComparator;

    /// In-memory ordered source for exercising the merge logic.
    struct VecIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        /// entries.len() means "invalid"
        pos: usize,
    }

    impl VecIter {
        fn new(entries: &[(&[u8], &[u8])]) -> Box<dyn Iter + Send> {
            Box::new(Self {
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .collect(),
                pos: usize::MAX,
            })
        }
    }

    impl Iter for VecIter {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }

        fn seek_to_first(&mut self) {
            self.pos = 0;
        }

        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().wrapping_sub(1);
        }

        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .partition_point(|(k, _)| k.as_slice() < target);
        }

        fn next(&mut self) {
            self.pos += 1;
        }

        fn prev(&mut self) {
            self.pos = self.pos.wrapping_sub(1);
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }

        fn status(&self) -> Result<()> {
            Ok(())
        }
    }

    fn merged(children: Vec<Box<dyn Iter + Send>>) -> MergingIterator {
        MergingIterator::new(Arc::new(BytewiseComparator::new()), children)
    }

    fn drain_forward(iter: &mut MergingIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            out.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.next();
        }
        out
    }

    #[test]
    fn test_merge_empty() {
        let mut iter = merged(vec![]);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_interleaved() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"c", b"3"), (b"e", b"5")]),
            VecIter::new(&[(b"b", b"2"), (b"d", b"4"), (b"f", b"6")]),
        ]);

        let keys: Vec<Vec<u8>> = drain_forward(&mut iter).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a", b"b", b"c", b"d", b"e", b"f"]);
    }

    #[test]
    fn test_merge_emits_union_multiset() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"b", b"2")]),
            VecIter::new(&[(b"b", b"2x"), (b"c", b"3")]),
        ]);

        let all = drain_forward(&mut iter);
        // Duplicate keys from different children are both surfaced
        assert_eq!(all.len(), 4);
        assert_eq!(all[1].0, b"b");
        assert_eq!(all[2].0, b"b");
    }

    #[test]
    fn test_merge_ties_prefer_earlier_child() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"k", b"newer")]),
            VecIter::new(&[(b"k", b"older")]),
        ]);

        iter.seek_to_first();
        assert_eq!(iter.value(), b"newer");
        iter.next();
        assert_eq!(iter.value(), b"older");
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_seek() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"d", b"4")]),
            VecIter::new(&[(b"b", b"2"), (b"e", b"5")]),
        ]);

        iter.seek(b"c");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"d");

        iter.seek(b"b");
        assert_eq!(iter.key(), b"b");

        iter.seek(b"z");
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_backward() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"c", b"3")]),
            VecIter::new(&[(b"b", b"2"), (b"d", b"4")]),
        ]);

        iter.seek_to_last();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.prev();
        }
        assert_eq!(keys, vec![b"d", b"c", b"b", b"a"]);
    }

    #[test]
    fn test_merge_direction_switch() {
        let mut iter = merged(vec![
            VecIter::new(&[(b"a", b"1"), (b"c", b"3")]),
            VecIter::new(&[(b"b", b"2"), (b"d", b"4")]),
        ]);

        iter.seek(b"c");
        assert_eq!(iter.key(), b"c");

        // Forward -> reverse at "c" yields "b"
        iter.prev();
        assert_eq!(iter.key(), b"b");

        // Reverse -> forward again yields "c"
        iter.next();
        assert_eq!(iter.key(), b"c");

        iter.next();
        assert_eq!(iter.key(), b"d");
    }
}
