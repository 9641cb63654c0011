//! Block reader: decodes the prefix-compressed entry format written by
//! the block builder.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::iterator::Iter;
use crate::util::coding::{decode_varint32, read_fixed32};
use crate::util::comparator::Comparator;

/// An immutable, parsed block of sorted entries.
#[derive(Debug)]
pub struct Block {
    /// Entry data followed by the restart array and its count.
    data: Bytes,
    /// Offset of the restart array.
    restart_offset: usize,
    /// Number of restart points.
    num_restarts: u32,
}

impl Block {
    /// Parse block contents (entries + restart array, no trailer).
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too short"));
        }

        let num_restarts = read_fixed32(&data[data.len() - 4..])
            .ok_or_else(|| Error::corruption("bad restart count"))?;

        let restart_array_size = num_restarts as usize * 4;
        if data.len() < 4 + restart_array_size {
            return Err(Error::corruption("block too short for restart array"));
        }

        let restart_offset = data.len() - 4 - restart_array_size;
        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// Raw block bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Approximate memory held by this block.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> u32 {
        debug_assert!(index < self.num_restarts);
        let offset = self.restart_offset + index as usize * 4;
        read_fixed32(&self.data[offset..]).unwrap_or(0)
    }
}

/// Cursor over one block. Owns the block, so it can outlive the cache
/// handle it was created from.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `restart_offset` when invalid.
    current: usize,
    /// Offset where the next entry parse begins.
    next_offset: usize,
    /// Restart region containing the current entry.
    restart_index: u32,
    /// Current key, reassembled across shared prefixes.
    key: Vec<u8>,
    value_offset: usize,
    value_len: usize,
    status: Option<Error>,
}

impl BlockIter {
    /// Create an iterator over `block`, ordering keys with `cmp`.
    pub fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> Self {
        let current = block.restart_offset;
        let restart_index = block.num_restarts;
        Self {
            block,
            cmp,
            current,
            next_offset: 0,
            restart_index,
            key: Vec::new(),
            value_offset: 0,
            value_len: 0,
            status: None,
        }
    }

    fn restart_offset(&self) -> usize {
        self.block.restart_offset
    }

    fn corrupt(&mut self) {
        self.current = self.restart_offset();
        self.restart_index = self.block.num_restarts;
        self.key.clear();
        self.value_offset = 0;
        self.value_len = 0;
        if self.status.is_none() {
            self.status = Some(Error::corruption("bad entry in block"));
        }
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.next_offset = self.block.restart_point(index) as usize;
        self.current = self.restart_offset();
        self.value_offset = self.next_offset;
        self.value_len = 0;
    }

    /// Decode the entry at `next_offset`; false at end of data or on
    /// corruption.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_offset;
        if self.current >= self.restart_offset() {
            // No more entries
            self.current = self.restart_offset();
            self.restart_index = self.block.num_restarts;
            return false;
        }

        let data = self.block.data.as_ref();
        let mut cursor = &data[self.current..self.restart_offset()];
        let before = cursor.len();

        let header = (
            decode_varint32(&mut cursor),
            decode_varint32(&mut cursor),
            decode_varint32(&mut cursor),
        );
        let (shared, unshared, value_len) = match header {
            (Some(s), Some(u), Some(v)) => (s as usize, u as usize, v as usize),
            _ => {
                self.corrupt();
                return false;
            }
        };

        if shared > self.key.len() || cursor.len() < unshared + value_len {
            self.corrupt();
            return false;
        }

        let header_len = before - cursor.len();
        self.key.truncate(shared);
        self.key.extend_from_slice(&cursor[..unshared]);
        self.value_offset = self.current + header_len + unshared;
        self.value_len = value_len;
        self.next_offset = self.value_offset + value_len;

        // Track which restart region the entry belongs to
        while self.restart_index + 1 < self.block.num_restarts
            && (self.block.restart_point(self.restart_index + 1) as usize) < self.current
        {
            self.restart_index += 1;
        }
        true
    }
}

impl Iter for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.restart_offset()
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts - 1);
        // Walk forward to the final entry
        while self.parse_next_entry() && self.next_offset < self.restart_offset() {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }

        // Binary search the restart array for the last restart whose
        // key is < target (restart entries always store a full key).
        let mut left = 0u32;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.block.restart_point(mid) as usize;

            let data = self.block.data.as_ref();
            let mut cursor = &data[region_offset..self.restart_offset()];
            let before = cursor.len();
            let header = (
                decode_varint32(&mut cursor),
                decode_varint32(&mut cursor),
                decode_varint32(&mut cursor),
            );
            let (shared, unshared) = match header {
                (Some(s), Some(u), Some(_)) => (s as usize, u as usize),
                _ => {
                    self.corrupt();
                    return;
                }
            };
            if shared != 0 || cursor.len() < unshared {
                self.corrupt();
                return;
            }
            let consumed = before - cursor.len();
            let mid_key = &data[region_offset + consumed..region_offset + consumed + unshared];

            if self.cmp.compare(mid_key, target) == std::cmp::Ordering::Less {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        // Linear scan forward from the chosen restart
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.cmp.compare(&self.key, target) != std::cmp::Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Back up to the last restart point before the current entry
        while self.block.restart_point(self.restart_index) as usize >= original {
            if self.restart_index == 0 {
                // Already at the first entry
                self.current = self.restart_offset();
                self.restart_index = self.block.num_restarts;
                return;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart_point(self.restart_index);
        // Scan forward until the entry right before `original`
        while self.parse_next_entry() && self.next_offset < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_offset..self.value_offset + self.value_len]
    }

    fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
