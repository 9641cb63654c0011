//! Two-level iteration: an index iterator yielding block handles,
//! composed with lazily constructed data-block iterators.

use crate::error::{Error, Result};
use crate::iterator::Iter;

use super::block::BlockIter;

/// Builds a data-block iterator from encoded block-handle bytes.
pub type BlockIterFactory = Box<dyn FnMut(&[u8]) -> Result<BlockIter> + Send>;

/// Iterator over (index entry -> data block) structures.
///
/// Invariant: while positioned, `data_iter` is the block referenced by
/// the current index entry. Data iterators are created lazily and
/// reused while the index entry's handle bytes stay unchanged.
pub struct TwoLevelIterator {
    index_iter: BlockIter,
    block_fn: BlockIterFactory,
    data_iter: Option<BlockIter>,
    /// Handle bytes `data_iter` was built from.
    data_handle: Vec<u8>,
    status: Option<Error>,
}

impl TwoLevelIterator {
    /// Compose `index_iter` with a data-block factory.
    pub fn new(index_iter: BlockIter, block_fn: BlockIterFactory) -> Self {
        Self {
            index_iter,
            block_fn,
            data_iter: None,
            data_handle: Vec::new(),
            status: None,
        }
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }

        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_handle == handle {
            // Still over the same block; nothing to rebuild
            return;
        }

        match (self.block_fn)(handle) {
            Ok(iter) => {
                self.data_handle.clear();
                self.data_handle.extend_from_slice(handle);
                self.data_iter = Some(iter);
            }
            Err(err) => {
                if self.status.is_none() {
                    self.status = Some(err);
                }
                self.data_iter = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter.as_ref().map_or(true, |d| !d.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data) = self.data_iter.as_mut() {
                data.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |d| d.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = self.data_iter.as_mut() {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data) = self.data_iter.as_ref() {
            data.status()?;
        }
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::block::Block;
    use crate::sstable::BlockBuilder;
    use crate::util::comparator::BytewiseComparator;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Build an index block over named in-memory data blocks.
    fn two_level(blocks: Vec<(&[u8], Vec<(&[u8], &[u8])>)>) -> TwoLevelIterator {
        let cmp: Arc<dyn crate::util::comparator::Comparator> =
            Arc::new(BytewiseComparator::new());

        let mut index_builder = BlockBuilder::new(1);
        let mut store: HashMap<Vec<u8>, Arc<Block>> = HashMap::new();

        for (separator, entries) in blocks {
            let mut builder = BlockBuilder::new(16);
            for (key, value) in entries {
                builder.add(key, value);
            }
            let block = Arc::new(Block::new(builder.finish()).unwrap());
            // Use the separator itself as the "handle"
            store.insert(separator.to_vec(), block);
            index_builder.add(separator, separator);
        }

        let index_block = Arc::new(Block::new(index_builder.finish()).unwrap());
        let index_iter = BlockIter::new(Arc::clone(&index_block), Arc::clone(&cmp));

        let factory_cmp = cmp;
        TwoLevelIterator::new(
            index_iter,
            Box::new(move |handle| {
                let block = store
                    .get(handle)
                    .ok_or_else(|| Error::corruption("unknown handle"))?;
                Ok(BlockIter::new(Arc::clone(block), Arc::clone(&factory_cmp)))
            }),
        )
    }

    fn collect_forward(iter: &mut TwoLevelIterator) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        iter.seek_to_first();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        keys
    }

    #[test]
    fn test_iterates_across_blocks() {
        let mut iter = two_level(vec![
            (b"b", vec![(b"a1", b"1"), (b"a2", b"2")]),
            (b"d", vec![(b"c1", b"3"), (b"c2", b"4")]),
            (b"f", vec![(b"e1", b"5")]),
        ]);

        let keys = collect_forward(&mut iter);
        assert_eq!(keys, vec![b"a1", b"a2", b"c1", b"c2", b"e1"]);
        assert!(iter.status().is_ok());
    }

    #[test]
    fn test_skips_empty_blocks() {
        let mut iter = two_level(vec![
            (b"b", vec![(b"a1", b"1")]),
            (b"d", vec![]),
            (b"f", vec![(b"e1", b"5")]),
        ]);

        let keys = collect_forward(&mut iter);
        assert_eq!(keys, vec![b"a1", b"e1"]);
    }

    #[test]
    fn test_seek_lands_in_right_block() {
        let mut iter = two_level(vec![
            (b"b", vec![(b"a1", b"1"), (b"a2", b"2")]),
            (b"d", vec![(b"c1", b"3"), (b"c2", b"4")]),
        ]);

        iter.seek(b"c2");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c2");
        assert_eq!(iter.value(), b"4");

        // Between blocks: next block's first entry
        iter.seek(b"a9");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"c1");

        iter.seek(b"zz");
        assert!(!iter.valid());
    }

    #[test]
    fn test_backward_iteration() {
        let mut iter = two_level(vec![
            (b"b", vec![(b"a1", b"1"), (b"a2", b"2")]),
            (b"d", vec![(b"c1", b"3")]),
        ]);

        iter.seek_to_last();
        assert_eq!(iter.key(), b"c1");
        iter.prev();
        assert_eq!(iter.key(), b"a2");
        iter.prev();
        assert_eq!(iter.key(), b"a1");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_factory_error_latches() {
        let cmp: Arc<dyn crate::util::comparator::Comparator> =
            Arc::new(BytewiseComparator::new());
        let mut index_builder = BlockBuilder::new(1);
        index_builder.add(b"separator", b"missing-handle");
        let index_block = Arc::new(Block::new(index_builder.finish()).unwrap());

        let mut iter = TwoLevelIterator::new(
            BlockIter::new(index_block, cmp),
            Box::new(|_| Err(Error::corruption("no such block"))),
        );

        iter.seek_to_first();
        assert!(!iter.valid());
        assert!(iter.status().is_err());
    }
}
