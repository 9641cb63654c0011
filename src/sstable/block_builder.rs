//! Block builder: prefix-compressed sorted key/value runs.
//!
//! Entry layout:
//!
//! ```text
//! varint32 shared | varint32 unshared | varint32 value_len
//! | unshared key bytes | value bytes
//! ```
//!
//! Every `restart_interval` entries the shared prefix length resets to
//! zero and the entry's offset is recorded, so readers can binary
//! search the restart array and decode forward from any restart point.

use bytes::{BufMut, Bytes, BytesMut};

use crate::options::DEFAULT_RESTART_INTERVAL;
use crate::util::coding::encode_varint32;

/// Builds a single block of sorted entries.
pub struct BlockBuilder {
    /// Destination buffer.
    buffer: BytesMut,
    /// Restart point offsets.
    restarts: Vec<u32>,
    /// Entries emitted since the last restart.
    counter: usize,
    /// Entries between restart points.
    restart_interval: usize,
    /// Last key added, for prefix compression.
    last_key: Vec<u8>,
    finished: bool,
}

impl BlockBuilder {
    /// Create a builder with the given restart interval.
    pub fn new(restart_interval: usize) -> Self {
        debug_assert!(restart_interval >= 1);
        Self {
            buffer: BytesMut::new(),
            restarts: vec![0],
            counter: 0,
            restart_interval,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Add a key/value pair.
    ///
    /// Keys must arrive in the comparator order of whoever owns this
    /// builder; prefix compression and restart placement only depend
    /// on the raw bytes.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);

        let shared = if self.counter < self.restart_interval {
            let min_len = std::cmp::min(self.last_key.len(), key.len());
            let mut shared = 0;
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
            shared
        } else {
            // Restart prefix compression from here
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        let unshared = key.len() - shared;

        encode_varint32(&mut self.buffer, shared as u32);
        encode_varint32(&mut self.buffer, unshared as u32);
        encode_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Whether no entries have been added since creation/reset.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Estimated encoded size of the finished block.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Append the restart array and return the block contents.
    ///
    /// The trailer (compression tag + checksum) is added by the table
    /// writer, not here.
    pub fn finish(&mut self) -> Bytes {
        debug_assert!(!self.finished);
        self.finished = true;

        for &restart in &self.restarts {
            self.buffer.put_u32_le(restart);
        }
        self.buffer.put_u32_le(self.restarts.len() as u32);
        self.buffer.clone().freeze()
    }

    /// Reset for building another block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        self.finished = false;
    }

    /// The last key added.
    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_INTERVAL)
    }
}
