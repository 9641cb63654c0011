//! Table reader: opens the on-disk table format and serves point
//! lookups and iteration.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::iterator::Iter;
use crate::options::{Compression, ReadOptions};
use crate::types::extract_user_key;
use crate::util::comparator::{Comparator, InternalKeyComparator};
use crate::util::crc::{unmask_crc, crc32c_multi};
use crate::util::coding::read_fixed32;

use super::block::{Block, BlockIter};
use super::filter::FilterPolicy;
use super::filter_block::FilterBlockReader;
use super::iterator::TwoLevelIterator;
use super::{BlockHandle, Footer, BLOCK_TRAILER_SIZE, FILTER_KEY_PREFIX, FOOTER_SIZE};

/// Iterator over a whole table.
pub type TableIterator = TwoLevelIterator;

/// An open, immutable table file.
pub struct Table {
    file: File,
    cmp: Arc<dyn Comparator>,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    block_cache: Option<Arc<BlockCache>>,
    /// Namespaces this table's keys within the shared block cache.
    cache_id: u64,
    /// File offset where the data blocks end.
    data_end: u64,
    /// Data blocks fetched from the file (cache misses).
    data_block_reads: AtomicU64,
}

impl Table {
    /// Open a table of `file_size` bytes.
    ///
    /// The index block is read eagerly; the filter block is loaded
    /// best-effort and lookups simply skip filtering without one.
    pub fn open(
        file: File,
        file_size: u64,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Table> {
        if (file_size as usize) < FOOTER_SIZE {
            return Err(Error::corruption("file is too short to be an sstable"));
        }

        let mut footer_buf = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index_contents = read_block_contents(&file, true, &footer.index_handle)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let cache_id = block_cache.as_ref().map_or(0, |cache| cache.new_id());

        let mut table = Table {
            file,
            cmp: Arc::new(InternalKeyComparator::new()),
            index_block,
            filter: None,
            block_cache,
            cache_id,
            data_end: footer.metaindex_handle.offset(),
            data_block_reads: AtomicU64::new(0),
        };
        if let Some(policy) = filter_policy {
            table.read_filter(&footer, policy);
        }
        Ok(table)
    }

    /// Locate and parse the filter block; any failure leaves the table
    /// filterless rather than unusable.
    fn read_filter(&mut self, footer: &Footer, policy: Arc<dyn FilterPolicy>) {
        if footer.metaindex_handle.size() == 0 {
            return;
        }
        let metaindex = match read_block_contents(&self.file, true, &footer.metaindex_handle)
            .and_then(Block::new)
        {
            Ok(block) => Arc::new(block),
            Err(err) => {
                debug!("ignoring unreadable metaindex block: {}", err);
                return;
            }
        };

        let key = format!("{}{}", FILTER_KEY_PREFIX, policy.name());
        let mut iter = BlockIter::new(
            metaindex,
            Arc::new(crate::util::comparator::BytewiseComparator::new()),
        );
        iter.seek(key.as_bytes());
        if !iter.valid() || iter.key() != key.as_bytes() {
            return;
        }

        let mut handle_bytes = iter.value();
        let handle = match BlockHandle::decode(&mut handle_bytes) {
            Ok(handle) => handle,
            Err(_) => return,
        };
        match read_block_contents(&self.file, true, &handle) {
            Ok(contents) => {
                self.filter = FilterBlockReader::new(policy, contents);
            }
            Err(err) => debug!("ignoring unreadable filter block: {}", err),
        }
    }

    /// Number of data blocks read from the file so far (cache misses
    /// included, cache hits not).
    pub fn data_block_reads(&self) -> u64 {
        self.data_block_reads.load(Ordering::Relaxed)
    }

    /// Find the first entry at or after `internal_key` in the block
    /// the index points at for it.
    ///
    /// Returns the raw (internal key, value) pair; the caller decides
    /// what its tag means. The filter is consulted first, so a
    /// definite miss costs no data-block read.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let mut index_iter =
            BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.cmp));
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let mut handle_bytes = index_iter.value();
        let handle = BlockHandle::decode(&mut handle_bytes)?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset(), extract_user_key(internal_key)) {
                // Definitely absent; no block read needed
                return Ok(None);
            }
        }

        let mut block_iter = self.block_iter_for_handle(options, &handle)?;
        block_iter.seek(internal_key);
        if block_iter.valid() {
            Ok(Some((
                Bytes::copy_from_slice(block_iter.key()),
                Bytes::copy_from_slice(block_iter.value()),
            )))
        } else {
            block_iter.status()?;
            Ok(None)
        }
    }

    /// An approximate file offset at or near where `internal_key`
    /// would live.
    pub fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter =
            BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.cmp));
        index_iter.seek(internal_key);
        if index_iter.valid() {
            let mut handle_bytes = index_iter.value();
            if let Ok(handle) = BlockHandle::decode(&mut handle_bytes) {
                return handle.offset();
            }
        }
        // Past the last key: all data blocks precede it
        self.data_end
    }

    /// Iterate over every entry of the table.
    pub fn iter(self: Arc<Self>, options: ReadOptions) -> TableIterator {
        let table = Arc::clone(&self);
        let index_iter = BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.cmp));
        TwoLevelIterator::new(
            index_iter,
            Box::new(move |handle_bytes| {
                let mut cursor = handle_bytes;
                let handle = BlockHandle::decode(&mut cursor)?;
                table.block_iter_for_handle(&options, &handle)
            }),
        )
    }

    /// Fetch the data block behind `handle`, via the block cache when
    /// one is configured, and return an iterator over it.
    fn block_iter_for_handle(
        &self,
        options: &ReadOptions,
        handle: &BlockHandle,
    ) -> Result<BlockIter> {
        let block = match &self.block_cache {
            Some(cache) => {
                if let Some(block) = cache.get(self.cache_id, handle.offset()) {
                    block
                } else {
                    let block = Arc::new(self.read_data_block(options, handle)?);
                    if options.fill_cache {
                        cache.insert(self.cache_id, handle.offset(), Arc::clone(&block));
                    }
                    block
                }
            }
            None => Arc::new(self.read_data_block(options, handle)?),
        };
        Ok(BlockIter::new(block, Arc::clone(&self.cmp)))
    }

    fn read_data_block(&self, options: &ReadOptions, handle: &BlockHandle) -> Result<Block> {
        self.data_block_reads.fetch_add(1, Ordering::Relaxed);
        let contents = read_block_contents(&self.file, options.verify_checksums, handle)?;
        Block::new(contents)
    }
}

/// Read one block's stored bytes plus trailer, verify, decompress.
fn read_block_contents(file: &File, verify: bool, handle: &BlockHandle) -> Result<Bytes> {
    let stored_len = handle.size() as usize;
    let mut raw = vec![0u8; stored_len + BLOCK_TRAILER_SIZE];
    file.read_exact_at(&mut raw, handle.offset())?;

    let tag = raw[stored_len];
    if verify {
        let stored_crc = read_fixed32(&raw[stored_len + 1..])
            .ok_or_else(|| Error::corruption("truncated block trailer"))?;
        let actual = crc32c_multi(&[&raw[..stored_len], &[tag]]);
        if actual != unmask_crc(stored_crc) {
            return Err(Error::corruption("block checksum mismatch"));
        }
    }

    match Compression::from_byte(tag) {
        Some(Compression::None) => {
            raw.truncate(stored_len);
            Ok(Bytes::from(raw))
        }
        Some(Compression::Snappy) => {
            let decompressed = snap::raw::Decoder::new()
                .decompress_vec(&raw[..stored_len])
                .map_err(|e| Error::corruption(format!("snappy decompress failed: {}", e)))?;
            Ok(Bytes::from(decompressed))
        }
        None => Err(Error::corruption("unknown block compression tag")),
    }
}
