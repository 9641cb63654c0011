//! Engine façade: composes the WAL, memtables, tables, and caches
//! into a readable/writable store.
//!
//! Writes flow batch -> WAL -> memtable; a full memtable is frozen and
//! flushed inline to a new table file. Reads consult the active
//! memtable, the immutable memtable being flushed, then every table
//! newest-first. There is no background compaction and no manifest:
//! the table set is exactly the table files in the directory, ordered
//! by file number.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::cache::{BlockCache, TableCache};
use crate::error::{Error, Result};
use crate::iterator::{DbIterator, Iter, MergingIterator};
use crate::memtable::MemTable;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::sstable::{BloomFilterPolicy, FilterPolicy, TableBuilder};
use crate::types::{
    LookupKey, LookupResult, ParsedInternalKey, SequenceNumber, ValueType, WriteBatch,
};
use crate::util::comparator::InternalKeyComparator;
use crate::util::filename::{
    list_db_files, log_file_path, table_file_path, temp_file_path, FileType,
};
use crate::wal::{Reporter, WalReader, WalWriter};

/// Mutable writer-side state, serialized behind one lock.
struct WriteState {
    wal: WalWriter,
    /// File number of the active WAL.
    log_number: u64,
    /// Next unused file number.
    next_file_number: u64,
}

struct DbInner {
    path: PathBuf,
    options: Options,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_cache: Option<Arc<BlockCache>>,
    table_cache: TableCache,
    /// Active memtable; swapped wholesale on freeze so readers never
    /// block on the write lock.
    mem: ArcSwap<MemTable>,
    /// Immutable memtable while a flush is in progress.
    imm: ArcSwapOption<MemTable>,
    /// Sequence number of the most recent completed write.
    last_sequence: AtomicU64,
    write_state: Mutex<WriteState>,
    /// Table file numbers, newest first.
    tables: RwLock<Vec<u64>>,
}

/// An embedded ordered key-value store.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

/// Reporter used during WAL recovery: log and keep going.
struct RecoveryReporter {
    log_number: u64,
}

impl Reporter for RecoveryReporter {
    fn corruption(&mut self, bytes: u64, reason: &str) {
        warn!(
            "recovery of log {:06}: dropping ~{} bytes: {}",
            self.log_number, bytes, reason
        );
    }
}

impl Db {
    /// Open (or create) a database at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if !options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    path.display()
                )));
            }
            std::fs::create_dir_all(&path)?;
        }

        let filter_policy: Option<Arc<dyn FilterPolicy>> = if options.bloom_bits_per_key > 0 {
            Some(Arc::new(BloomFilterPolicy::new(options.bloom_bits_per_key)))
        } else {
            None
        };
        let block_cache = if options.block_cache_size > 0 {
            Some(Arc::new(BlockCache::new(options.block_cache_size)))
        } else {
            None
        };
        let table_cache = TableCache::new(
            &path,
            options.max_open_files.saturating_sub(10).max(16),
            filter_policy.clone(),
            block_cache.clone(),
        );

        // Survey the directory
        let mut log_numbers = Vec::new();
        let mut table_numbers = Vec::new();
        let mut max_file_number = 0;
        for (file_type, number) in list_db_files(&path)? {
            max_file_number = max_file_number.max(number);
            match file_type {
                FileType::Log => log_numbers.push(number),
                FileType::Table => table_numbers.push(number),
                FileType::Temp => {
                    let _ = std::fs::remove_file(temp_file_path(&path, number));
                }
                _ => {}
            }
        }
        log_numbers.sort_unstable();
        table_numbers.sort_unstable();
        table_numbers.reverse(); // newest first

        // Without a manifest, the newest sequence is recovered by
        // scanning: tables for their largest entry sequence, then the
        // logs during replay.
        let mut last_sequence = 0;
        for &number in &table_numbers {
            last_sequence = last_sequence.max(max_table_sequence(&table_cache, number)?);
        }

        let mut next_file_number = max_file_number + 1;
        let mut table_numbers = table_numbers;
        for &number in &log_numbers {
            let (max_seq, recovered) = replay_log(&path, number)?;
            last_sequence = last_sequence.max(max_seq);
            if let Some(mem) = recovered {
                let table_number = next_file_number;
                next_file_number += 1;
                build_table_file(&path, &options, filter_policy.clone(), &mem, table_number)?;
                table_numbers.insert(0, table_number);
            }
        }

        // Start a fresh WAL; everything recovered is in tables now
        let log_number = next_file_number;
        next_file_number += 1;
        let wal = WalWriter::new(&log_file_path(&path, log_number))?;
        for &number in &log_numbers {
            let _ = std::fs::remove_file(log_file_path(&path, number));
        }

        let inner = DbInner {
            path,
            options,
            filter_policy,
            block_cache,
            table_cache,
            mem: ArcSwap::from_pointee(MemTable::new()),
            imm: ArcSwapOption::new(None),
            last_sequence: AtomicU64::new(last_sequence),
            write_state: Mutex::new(WriteState {
                wal,
                log_number,
                next_file_number,
            }),
            tables: RwLock::new(table_numbers),
        };
        Ok(Db {
            inner: Arc::new(inner),
        })
    }

    /// Store `value` under `key`.
    pub fn put(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Remove `key` (writes a tombstone).
    pub fn delete(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Apply a batch of updates atomically.
    pub fn write(&self, options: &WriteOptions, mut batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.inner.write_state.lock();

        let base = self.inner.last_sequence.load(Ordering::SeqCst) + 1;
        batch.set_sequence(base);

        state.wal.add_record(batch.contents())?;
        if options.sync {
            state.wal.sync()?;
        } else {
            state.wal.flush()?;
        }

        let mem = self.inner.mem.load_full();
        batch.insert_into(&mem)?;

        // Publish: reads started after this see the new data
        self.inner
            .last_sequence
            .store(base + batch.count() as u64 - 1, Ordering::SeqCst);

        if mem.approximate_memory_usage() >= self.inner.options.write_buffer_size {
            self.freeze_and_flush(&mut state, mem)?;
        }
        Ok(())
    }

    /// Swap in a fresh memtable + WAL, then flush the frozen one.
    fn freeze_and_flush(
        &self,
        state: &mut WriteState,
        frozen: Arc<MemTable>,
    ) -> Result<()> {
        let old_log = state.log_number;

        let log_number = state.next_file_number;
        state.next_file_number += 1;
        state.wal = WalWriter::new(&log_file_path(&self.inner.path, log_number))?;
        state.log_number = log_number;

        self.inner.imm.store(Some(Arc::clone(&frozen)));
        self.inner.mem.store(Arc::new(MemTable::new()));

        self.write_table(state, &frozen)?;
        self.inner.imm.store(None);

        let _ = std::fs::remove_file(log_file_path(&self.inner.path, old_log));
        Ok(())
    }

    /// Write a memtable out as a table file and register it.
    fn write_table(&self, state: &mut WriteState, mem: &MemTable) -> Result<()> {
        let number = state.next_file_number;
        state.next_file_number += 1;
        build_table_file(
            &self.inner.path,
            &self.inner.options,
            self.inner.filter_policy.clone(),
            mem,
            number,
        )?;
        self.inner.tables.write().insert(0, number);
        Ok(())
    }

    /// Read the newest visible value for `key`.
    ///
    /// Returns `Ok(None)` when the key is absent or deleted as of the
    /// read's snapshot.
    pub fn get(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Bytes>> {
        let sequence = options
            .snapshot
            .unwrap_or_else(|| self.inner.last_sequence.load(Ordering::SeqCst));
        let lookup = LookupKey::new(key, sequence);

        // Active memtable, then the one being flushed
        match self.inner.mem.load().get(&lookup) {
            LookupResult::Found(value) => return Ok(Some(value)),
            LookupResult::Deleted => return Ok(None),
            LookupResult::NotFound => {}
        }
        if let Some(imm) = self.inner.imm.load_full() {
            match imm.get(&lookup) {
                LookupResult::Found(value) => return Ok(Some(value)),
                LookupResult::Deleted => return Ok(None),
                LookupResult::NotFound => {}
            }
        }

        // Tables, newest first; the first version of the user key
        // decides.
        let tables = self.inner.tables.read().clone();
        for number in tables {
            let found =
                self.inner
                    .table_cache
                    .internal_get(options, number, lookup.internal_key())?;
            if let Some((internal_key, value)) = found {
                let parsed = ParsedInternalKey::parse(&internal_key)
                    .ok_or_else(|| Error::corruption("bad internal key in table"))?;
                if parsed.user_key == key {
                    return match parsed.value_type {
                        Some(ValueType::Value) => Ok(Some(value)),
                        _ => Ok(None),
                    };
                }
            }
        }
        Ok(None)
    }

    /// The sequence number of the latest completed write; pass it via
    /// [`ReadOptions::at_snapshot`] for repeatable reads.
    pub fn snapshot(&self) -> SequenceNumber {
        self.inner.last_sequence.load(Ordering::SeqCst)
    }

    /// Iterate over live user keys as of the read snapshot.
    pub fn iter(&self, options: &ReadOptions) -> Result<DbIterator> {
        let sequence = options
            .snapshot
            .unwrap_or_else(|| self.inner.last_sequence.load(Ordering::SeqCst));

        let mut children: Vec<Box<dyn Iter + Send>> = Vec::new();
        children.push(Box::new(self.inner.mem.load_full().iter()));
        if let Some(imm) = self.inner.imm.load_full() {
            children.push(Box::new(imm.iter()));
        }
        for number in self.inner.tables.read().iter() {
            children.push(Box::new(self.inner.table_cache.iter(*options, *number)?));
        }

        let merging =
            MergingIterator::new(Arc::new(InternalKeyComparator::new()), children);
        Ok(DbIterator::new(merging, sequence))
    }

    /// Force the active memtable out to a table file.
    ///
    /// Mostly useful in tests and before backups; normal operation
    /// flushes automatically by size.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.write_state.lock();
        let mem = self.inner.mem.load_full();
        if mem.approximate_memory_usage() == 0 {
            return Ok(());
        }
        self.freeze_and_flush(&mut state, mem)
    }

    /// Database directory path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Bytes of table data currently held by the block cache.
    pub fn block_cache_usage(&self) -> usize {
        self.inner
            .block_cache
            .as_ref()
            .map_or(0, |cache| cache.total_charge())
    }
}

/// Largest entry sequence stored in table `number`.
fn max_table_sequence(table_cache: &TableCache, number: u64) -> Result<SequenceNumber> {
    let mut iter = table_cache.iter(ReadOptions::new(), number)?;
    let mut max_sequence = 0;
    iter.seek_to_first();
    while iter.valid() {
        if let Some(parsed) = ParsedInternalKey::parse(iter.key()) {
            max_sequence = max_sequence.max(parsed.sequence);
        }
        iter.next();
    }
    iter.status()?;
    Ok(max_sequence)
}

/// Replay one WAL into a fresh memtable.
///
/// Returns the largest sequence seen and the memtable (None when the
/// log held no applicable writes).
fn replay_log(db_path: &Path, number: u64) -> Result<(SequenceNumber, Option<MemTable>)> {
    let path = log_file_path(db_path, number);
    let mut reader = WalReader::open(&path, Some(Box::new(RecoveryReporter { log_number: number })))?;

    let mem = MemTable::new();
    let mut max_sequence = 0;
    let mut batches = 0u64;
    while let Some(record) = reader.read_record() {
        let batch = match WriteBatch::from_contents(&record) {
            Ok(batch) => batch,
            Err(err) => {
                warn!("recovery of log {:06}: {}", number, err);
                continue;
            }
        };
        batch.insert_into(&mem)?;
        max_sequence = max_sequence.max(batch.sequence() + batch.count() as u64 - 1);
        batches += 1;
    }
    info!("recovered {} batches from log {:06}", batches, number);

    if batches == 0 {
        return Ok((max_sequence, None));
    }
    Ok((max_sequence, Some(mem)))
}

/// Build table file `number` from a memtable's contents.
fn build_table_file(
    db_path: &Path,
    options: &Options,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    mem: &MemTable,
    number: u64,
) -> Result<()> {
    let path = table_file_path(db_path, number);
    let mut builder = TableBuilder::new(&path, options, filter_policy)?;
    let mut iter = mem.iter();
    iter.seek_to_first();
    while iter.valid() {
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    let info = builder.finish()?;
    info!(
        "flushed memtable to table {:06} ({} entries, {} bytes)",
        number, info.entry_count, info.file_size
    );
    Ok(())
}
