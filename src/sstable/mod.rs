//! SSTable - immutable sorted on-disk tables.
//!
//! # File format
//!
//! ```text
//! +---------------------+
//! | data block 1        |
//! +---------------------+
//! | ...                 |
//! +---------------------+
//! | data block N        |
//! +---------------------+
//! | filter (meta) block |
//! +---------------------+
//! | metaindex block     |   "filter.<policy>" -> filter handle
//! +---------------------+
//! | index block         |   separator key -> data block handle
//! +---------------------+
//! | footer (48 bytes)   |
//! +---------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: a one-byte compression
//! tag and a masked CRC-32C covering the stored payload plus the tag.

mod block;
mod block_builder;
mod filter;
mod filter_block;
mod iterator;
mod reader;
mod writer;

pub(crate) use filter::hash;

pub use block::{Block, BlockIter};
pub use block_builder::BlockBuilder;
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use filter_block::{FilterBlockBuilder, FilterBlockReader};
pub use iterator::{BlockIterFactory, TwoLevelIterator};
pub use reader::{Table, TableIterator};
pub use writer::{TableBuilder, TableInfo};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::util::coding::{decode_varint64, encode_varint64, read_fixed64};

/// Magic number carried in the footer of every table file.
pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Encoded footer length: two zero-padded handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * MAX_BLOCK_HANDLE_ENCODED + 8;

/// Maximum encoded length of a [`BlockHandle`].
pub const MAX_BLOCK_HANDLE_ENCODED: usize = 20;

/// Block trailer: compression tag (1) + masked CRC (4).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Metaindex key prefix for filter blocks.
pub const FILTER_KEY_PREFIX: &str = "filter.";

/// Location of a block within a table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    /// Create a new block handle.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Byte offset of the block within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Stored size of the block, not counting the trailer.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the varint encoding to a buffer.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        encode_varint64(buf, self.offset);
        encode_varint64(buf, self.size);
    }

    /// Encode to a standalone byte string.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_BLOCK_HANDLE_ENCODED);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    /// Decode a handle, advancing the input past it.
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let offset = decode_varint64(input)
            .ok_or_else(|| Error::corruption("bad block handle offset"))?;
        let size =
            decode_varint64(input).ok_or_else(|| Error::corruption("bad block handle size"))?;
        Ok(Self { offset, size })
    }
}

/// Table footer: handles for the metaindex and index blocks.
#[derive(Debug, Clone)]
pub struct Footer {
    /// Handle of the metaindex block.
    pub metaindex_handle: BlockHandle,
    /// Handle of the index block.
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Create a new footer.
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            metaindex_handle,
            index_handle,
        }
    }

    /// Encode to the fixed 48-byte footer layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        self.metaindex_handle.encode_to(&mut buf);
        self.index_handle.encode_to(&mut buf);
        buf.resize(2 * MAX_BLOCK_HANDLE_ENCODED, 0);
        buf.put_u64_le(TABLE_MAGIC);
        debug_assert_eq!(buf.len(), FOOTER_SIZE);
        buf.freeze()
    }

    /// Decode from exactly [`FOOTER_SIZE`] trailing bytes of a file.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::corruption("footer too short"));
        }
        let footer = &data[data.len() - FOOTER_SIZE..];

        let magic = read_fixed64(&footer[FOOTER_SIZE - 8..])
            .ok_or_else(|| Error::corruption("footer truncated"))?;
        if magic != TABLE_MAGIC {
            return Err(Error::corruption("not an sstable (bad magic number)"));
        }

        let mut cursor = footer;
        let metaindex_handle = BlockHandle::decode(&mut cursor)?;
        let index_handle = BlockHandle::decode(&mut cursor)?;

        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_roundtrip() {
        for (offset, size) in [(0, 0), (100, 200), (u64::MAX, u64::MAX >> 1)] {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encode();
            assert!(encoded.len() <= MAX_BLOCK_HANDLE_ENCODED);

            let mut cursor = &encoded[..];
            let decoded = BlockHandle::decode(&mut cursor).unwrap();
            assert_eq!(decoded, handle);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn test_block_handle_truncated() {
        let handle = BlockHandle::new(1 << 30, 1 << 20);
        let encoded = handle.encode();
        let mut cursor = &encoded[..encoded.len() - 1];
        assert!(BlockHandle::decode(&mut cursor).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(4096, 128), BlockHandle::new(8192, 256));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.metaindex_handle, footer.metaindex_handle);
        assert_eq!(decoded.index_handle, footer.index_handle);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer::new(BlockHandle::new(0, 0), BlockHandle::new(0, 0));
        let mut encoded = footer.encode().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(Footer::decode(&encoded).is_err());
    }

    #[test]
    fn test_footer_magic_bytes() {
        let footer = Footer::new(BlockHandle::new(0, 0), BlockHandle::new(0, 0));
        let encoded = footer.encode();
        // Little-endian magic in the last 8 bytes
        assert_eq!(
            &encoded[FOOTER_SIZE - 8..],
            &[0x57, 0xfb, 0x80, 0x8b, 0x24, 0x75, 0x47, 0xdb]
        );
    }
}
