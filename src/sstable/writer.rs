//! Table builder: streams sorted internal-key entries into the
//! on-disk table format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::options::{Compression, Options};
use crate::types::extract_user_key;
use crate::util::crc::{crc32c_multi, mask_crc};
use crate::util::comparator::{Comparator, InternalKeyComparator};

use super::block_builder::BlockBuilder;
use super::filter::FilterPolicy;
use super::filter_block::FilterBlockBuilder;
use super::{BlockHandle, Footer, FILTER_KEY_PREFIX};

/// Summary of a finished table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Total file size in bytes.
    pub file_size: u64,
    /// Number of entries written.
    pub entry_count: u64,
    /// Smallest internal key, if any entries were added.
    pub smallest: Option<Bytes>,
    /// Largest internal key, if any entries were added.
    pub largest: Option<Bytes>,
}

/// Streaming writer for one immutable table file.
///
/// Keys must be added in increasing internal-key order. Dropping the
/// builder without calling [`TableBuilder::finish`] abandons the file
/// contents.
pub struct TableBuilder {
    file: BufWriter<File>,
    /// File offset where the next block lands.
    offset: u64,
    cmp: InternalKeyComparator,
    data_block: BlockBuilder,
    /// Separators only ever bound one lookup each, so the index block
    /// does not benefit from prefix compression.
    index_block: BlockBuilder,
    filter_block: Option<(FilterBlockBuilder, &'static str)>,
    /// Last key passed to `add`.
    last_key: Vec<u8>,
    /// Handle of the just-flushed data block, awaiting its index
    /// entry. The entry is deferred until the next `add` so the
    /// separator can use the real next key as its upper bound.
    pending_handle: Option<BlockHandle>,
    num_entries: u64,
    smallest: Option<Bytes>,
    compression: Compression,
    block_size: usize,
    finished: bool,
}

impl TableBuilder {
    /// Create a builder writing to a new file at `path`.
    pub fn new(
        path: &Path,
        options: &Options,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let filter_block = filter_policy.map(|policy| {
            let name = policy.name();
            let mut builder = FilterBlockBuilder::new(policy);
            builder.start_block(0);
            (builder, name)
        });

        Ok(Self {
            file: BufWriter::with_capacity(options.block_size * 2, file),
            offset: 0,
            cmp: InternalKeyComparator::new(),
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_block: BlockBuilder::new(1),
            filter_block,
            last_key: Vec::new(),
            pending_handle: None,
            num_entries: 0,
            smallest: None,
            compression: options.compression,
            block_size: options.block_size,
            finished: false,
        })
    }

    /// Number of entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Current file size, counting only completed blocks.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Add an internal-key entry. Keys must arrive in ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(
            self.num_entries == 0
                || self.cmp.compare(key, &self.last_key) == std::cmp::Ordering::Greater,
            "keys must be added in increasing order"
        );

        if let Some(handle) = self.pending_handle.take() {
            // Now that the first key of the new block is known, a
            // short separator between the blocks can be chosen.
            let separator = self.cmp.find_shortest_separator(&self.last_key, key);
            self.index_block.add(&separator, &handle.encode());
        }

        if let Some((filter, _)) = self.filter_block.as_mut() {
            filter.add_key(extract_user_key(key));
        }

        if self.smallest.is_none() {
            self.smallest = Some(Bytes::copy_from_slice(key));
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Write out the buffered data block, if any.
    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(self.pending_handle.is_none());

        let contents = self.data_block.finish();
        let handle = self.write_block(&contents)?;
        self.data_block.reset();
        self.pending_handle = Some(handle);

        if let Some((filter, _)) = self.filter_block.as_mut() {
            filter.start_block(self.offset);
        }
        Ok(())
    }

    /// Compress (when profitable) and write one block plus trailer.
    fn write_block(&mut self, contents: &[u8]) -> Result<BlockHandle> {
        match self.compression {
            Compression::None => self.write_raw_block(contents, Compression::None),
            Compression::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .unwrap_or_default();
                // Keep the raw bytes unless compression buys >= 12.5%
                if !compressed.is_empty() && compressed.len() < contents.len() - contents.len() / 8
                {
                    self.write_raw_block(&compressed, Compression::Snappy)
                } else {
                    self.write_raw_block(contents, Compression::None)
                }
            }
        }
    }

    /// Write stored bytes followed by the 5-byte trailer.
    fn write_raw_block(&mut self, contents: &[u8], compression: Compression) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.write_all(contents)?;

        // Trailer: compression tag, then masked CRC over the stored
        // payload and the tag.
        let tag = compression.to_byte();
        let crc = mask_crc(crc32c_multi(&[contents, &[tag]]));
        let mut trailer = [0u8; 5];
        trailer[0] = tag;
        trailer[1..].copy_from_slice(&crc.to_le_bytes());
        self.file.write_all(&trailer)?;

        self.offset += contents.len() as u64 + trailer.len() as u64;
        Ok(handle)
    }

    /// Flush remaining blocks, write the metaindex, index, and footer,
    /// and sync the file.
    pub fn finish(mut self) -> Result<TableInfo> {
        debug_assert!(!self.finished);
        self.finished = true;
        self.flush_data_block()?;

        // Filter block (never compressed; readers slice into it)
        let filter_handle = match self.filter_block.take() {
            Some((filter, name)) => {
                let contents = filter.finish();
                Some((self.write_raw_block(&contents, Compression::None)?, name))
            }
            None => None,
        };

        // Metaindex block: filter.<policy name> -> filter handle
        let mut metaindex = BlockBuilder::new(1);
        if let Some((handle, name)) = filter_handle {
            let key = format!("{}{}", FILTER_KEY_PREFIX, name);
            metaindex.add(key.as_bytes(), &handle.encode());
        }
        let metaindex_contents = metaindex.finish();
        let metaindex_handle = self.write_block(&metaindex_contents)?;

        // Index block, including the entry for the final data block
        if let Some(handle) = self.pending_handle.take() {
            let successor = self.cmp.find_short_successor(&self.last_key);
            self.index_block.add(&successor, &handle.encode());
        }
        let index_contents = self.index_block.finish();
        let index_handle = self.write_block(&index_contents)?;

        // Footer
        let footer = Footer::new(metaindex_handle, index_handle).encode();
        self.file.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(TableInfo {
            file_size: self.offset,
            entry_count: self.num_entries,
            smallest: self.smallest,
            largest: if self.num_entries > 0 {
                Some(Bytes::copy_from_slice(&self.last_key))
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::filter::BloomFilterPolicy;
    use crate::types::InternalKey;
    use crate::util::coding::read_fixed64;
    use tempfile::tempdir;

    fn ikey(user_key: &str, seq: u64) -> Bytes {
        InternalKey::for_value(Bytes::from(user_key.to_string()), seq).encode()
    }

    fn default_builder(path: &Path) -> TableBuilder {
        TableBuilder::new(
            path,
            &Options {
                compression: Compression::None,
                ..Options::default()
            },
            Some(Arc::new(BloomFilterPolicy::new(10))),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_table_has_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");

        let builder = default_builder(&path);
        let info = builder.finish().unwrap();

        assert_eq!(info.entry_count, 0);
        assert!(info.smallest.is_none());
        assert!(info.largest.is_none());

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, info.file_size);

        // Magic is present in the last 8 bytes
        let magic = read_fixed64(&data[data.len() - 8..]).unwrap();
        assert_eq!(magic, crate::sstable::TABLE_MAGIC);
    }

    #[test]
    fn test_info_tracks_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000001.ldb");

        let mut builder = default_builder(&path);
        builder.add(&ikey("apple", 3), b"a").unwrap();
        builder.add(&ikey("banana", 2), b"b").unwrap();
        builder.add(&ikey("cherry", 1), b"c").unwrap();
        let info = builder.finish().unwrap();

        assert_eq!(info.entry_count, 3);
        assert_eq!(
            extract_user_key(info.smallest.as_ref().unwrap()),
            b"apple"
        );
        assert_eq!(
            extract_user_key(info.largest.as_ref().unwrap()),
            b"cherry"
        );
    }

    #[test]
    fn test_small_block_size_splits_blocks() {
        let dir = tempdir().unwrap();
        let path_small = dir.path().join("small.ldb");
        let path_large = dir.path().join("large.ldb");

        let write = |path: &Path, block_size: usize| {
            let mut builder = TableBuilder::new(
                path,
                &Options {
                    compression: Compression::None,
                    block_size,
                    ..Options::default()
                },
                None,
            )
            .unwrap();
            for i in 0..200 {
                let key = ikey(&format!("key{:04}", i), i as u64 + 1);
                builder.add(&key, &[b'v'; 50]).unwrap();
            }
            builder.finish().unwrap()
        };

        let small = write(&path_small, 256);
        let large = write(&path_large, 1 << 20);

        // More blocks means more trailers and index entries
        assert!(small.file_size > large.file_size);
    }

    #[test]
    fn test_snappy_shrinks_compressible_data() {
        let dir = tempdir().unwrap();
        let raw_path = dir.path().join("raw.ldb");
        let snappy_path = dir.path().join("snappy.ldb");

        let write = |path: &Path, compression: Compression| {
            let mut builder = TableBuilder::new(
                path,
                &Options {
                    compression,
                    ..Options::default()
                },
                None,
            )
            .unwrap();
            for i in 0..100 {
                let key = ikey(&format!("key{:04}", i), i as u64 + 1);
                builder.add(&key, &[b'x'; 200]).unwrap();
            }
            builder.finish().unwrap()
        };

        let raw = write(&raw_path, Compression::None);
        let snappy = write(&snappy_path, Compression::Snappy);
        assert!(snappy.file_size < raw.file_size);
    }
}
