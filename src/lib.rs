//! # stratadb
//!
//! Core storage engine of an embedded ordered key-value store, built
//! on the log-structured merge-tree design.
//!
//! - **Ordered byte-string keys and values** with point reads, range
//!   iteration, deletions (tombstones), and atomic batches
//! - **Snapshot-consistent reads**: every write carries a sequence
//!   number, and any read can pin one
//! - **Durability** through a checksummed write-ahead log
//! - **Immutable sorted tables** with prefix-compressed blocks, bloom
//!   filters, and a sharded block/table cache
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use stratadb::{Db, Options, ReadOptions, WriteOptions};
//!
//! let db = Db::open("./data", Options::default())?;
//! let wo = WriteOptions::default();
//!
//! db.put(&wo, b"hello", b"world")?;
//! let value = db.get(&ReadOptions::new(), b"hello")?;
//!
//! let snapshot = db.snapshot();
//! db.delete(&wo, b"hello")?;
//! // Reads at `snapshot` still see the old value
//! let old = db.get(&ReadOptions::at_snapshot(snapshot), b"hello")?;
//! ```

pub mod error;
pub mod options;
pub mod types;

mod db;

mod cache;
mod iterator;
mod memtable;
mod sstable;
mod util;
mod wal;

pub use error::{Error, Result};
pub use options::{Compression, Options, ReadOptions, WriteOptions};
pub use types::{
    InternalKey, LookupKey, LookupResult, ParsedInternalKey, SequenceNumber, ValueType,
    WriteBatch, WriteBatchHandler, MAX_SEQUENCE,
};

pub use db::Db;

// Building blocks, exposed for embedding and tooling
pub use cache::{BlockCache, CacheHandle, CacheStats, Deleter, ShardedCache, TableCache};
pub use iterator::{DbIterator, Iter, MergingIterator};
pub use memtable::{MemTable, MemTableIterator};
pub use sstable::{
    Block, BlockBuilder, BlockHandle, BlockIter, BlockIterFactory, BloomFilterPolicy,
    FilterBlockBuilder, FilterBlockReader, FilterPolicy, Footer, Table, TableBuilder, TableInfo,
    TableIterator, TwoLevelIterator,
};
pub use util::comparator::{BytewiseComparator, Comparator, InternalKeyComparator};
pub use wal::{Reporter, WalReader, WalWriter};
