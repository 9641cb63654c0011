//! Filter block: an array of per-region filters indexed by data-block
//! file offset.
//!
//! One filter covers each 2KB span of data-block address space; a data
//! block starting at offset `o` is covered by filter `o >> 11`. The
//! block layout is:
//!
//! ```text
//! filter 0 | filter 1 | ... | filter N-1
//! | fixed32 offset of filter 0 | ... | fixed32 offset of filter N-1
//! | fixed32 offset-array start | u8 base_lg
//! ```

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::read_fixed32;

use super::filter::FilterPolicy;

/// Every filter covers 1 << FILTER_BASE_LG bytes of data-block offsets.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys per region and emits the filter block.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Flattened key bytes buffered for the current region.
    keys: Vec<u8>,
    /// Start offset of each buffered key within `keys`.
    start: Vec<usize>,
    /// Filter bytes emitted so far.
    result: BytesMut,
    /// Offset of each emitted filter within `result`.
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    /// Create a builder for the given policy.
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            start: Vec::new(),
            result: BytesMut::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Note that a new data block begins at `block_offset`. Emits
    /// filters for every region that ended before it.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Buffer a key belonging to the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.start.push(self.keys.len());
        self.keys.extend_from_slice(key);
    }

    /// Emit any pending filter and the trailer; returns the block.
    pub fn finish(mut self) -> Bytes {
        if !self.start.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;
        for &offset in &self.filter_offsets {
            self.result.put_u32_le(offset);
        }
        self.result.put_u32_le(array_offset);
        self.result.put_u8(FILTER_BASE_LG);
        self.result.freeze()
    }

    fn generate_filter(&mut self) {
        let num_keys = self.start.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            // Region with no keys: record an empty filter
            return;
        }

        self.start.push(self.keys.len()); // sentinel
        let key_slices: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.start[i]..self.start[i + 1]])
            .collect();
        self.policy.create_filter(&key_slices, &mut self.result);

        self.keys.clear();
        self.start.clear();
    }
}

/// Reads filters back out of an encoded filter block.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Bytes,
    /// Start of the offset array.
    offset_array: usize,
    /// Number of filters.
    num: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    /// Parse a filter block. Returns None on malformed contents.
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Bytes) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let base_lg = data[data.len() - 1];
        let offset_array = read_fixed32(&data[data.len() - 5..])? as usize;
        if offset_array > data.len() - 5 {
            return None;
        }
        let num = (data.len() - 5 - offset_array) / 4;
        Some(Self {
            policy,
            data,
            offset_array,
            num,
            base_lg,
        })
    }

    /// Whether `key` may be present in the data block that starts at
    /// `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num {
            // Out of range: err on the side of a read
            return true;
        }

        let start = read_fixed32(&self.data[self.offset_array + index * 4..]);
        // For the last filter this reads the array-start field, which
        // is exactly where that filter ends.
        let limit = read_fixed32(&self.data[self.offset_array + index * 4 + 4..]);
        let (Some(start), Some(limit)) = (start, limit) else {
            return true;
        };

        if start > limit || limit as usize > self.offset_array {
            // Malformed entry: treat as corruption of this filter
            return true;
        }
        if start == limit {
            // Empty filter covers no keys
            return false;
        }

        self.policy
            .key_may_match(key, &self.data[start as usize..limit as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::super::filter::BloomFilterPolicy;
    use super::*;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn test_empty_builder() {
        let builder = FilterBlockBuilder::new(policy());
        let block = builder.finish();
        // offset array start (0) + base_lg
        assert_eq!(&block[..], &[0, 0, 0, 0, FILTER_BASE_LG]);

        let reader = FilterBlockReader::new(policy(), block).unwrap();
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn test_single_region() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");

        let block = builder.finish();
        let reader = FilterBlockReader::new(policy(), block).unwrap();

        // All offsets < 2KB share filter 0
        for key in [b"foo".as_slice(), b"bar", b"box", b"hello"] {
            assert!(reader.key_may_match(100, key));
        }
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn test_multiple_regions() {
        let mut builder = FilterBlockBuilder::new(policy());

        // Region 0 (offsets 0..2047)
        builder.start_block(0);
        builder.add_key(b"alpha");

        // Region 1 (2048..4095)
        builder.start_block(2048);
        builder.add_key(b"bravo");

        // Regions 2-3 are empty; region 4 gets a key
        builder.start_block(9000);
        builder.add_key(b"charlie");

        let block = builder.finish();
        let reader = FilterBlockReader::new(policy(), block).unwrap();

        // Keys land in the filter selected by offset >> 11
        assert!(reader.key_may_match(0, b"alpha"));
        assert!(reader.key_may_match(2048, b"bravo"));
        assert!(reader.key_may_match(9000, b"charlie"));

        // Cross-region queries miss
        assert!(!reader.key_may_match(0, b"bravo"));
        assert!(!reader.key_may_match(2048, b"alpha"));

        // Empty regions answer "definitely absent"
        assert!(!reader.key_may_match(4100, b"alpha"));
        assert!(!reader.key_may_match(6200, b"bravo"));
    }

    #[test]
    fn test_block_layout() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(0);
        builder.add_key(b"k");
        let block = builder.finish();

        // Trailing byte is base_lg
        assert_eq!(block[block.len() - 1], FILTER_BASE_LG);
        // One 9-byte filter (64-bit floor + k byte), so the offset
        // array starts at 9 and holds one zero entry
        let array_start = read_fixed32(&block[block.len() - 5..]).unwrap();
        assert_eq!(array_start, 9);
        assert_eq!(read_fixed32(&block[9..]).unwrap(), 0);
    }

    #[test]
    fn test_reader_rejects_malformed() {
        assert!(FilterBlockReader::new(policy(), Bytes::from_static(&[1, 2])).is_none());

        // Offset array start past the end
        let bad = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0x7F, 11]);
        assert!(FilterBlockReader::new(policy(), bad).is_none());
    }
}
