//! Table cache: bounded set of open table readers keyed by file
//! number.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::options::ReadOptions;
use crate::sstable::{FilterPolicy, Table, TableIterator};
use crate::util::filename::{legacy_table_file_path, table_file_path};

use super::block_cache::BlockCache;
use super::lru::{CacheStats, ShardedCache};

/// Caches open [`Table`] readers so repeated reads of a file skip the
/// open/footer/index work.
pub struct TableCache {
    db_path: PathBuf,
    cache: ShardedCache<Arc<Table>>,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_cache: Option<Arc<BlockCache>>,
}

impl TableCache {
    /// Create a cache holding at most `capacity` open tables.
    pub fn new(
        db_path: impl AsRef<Path>,
        capacity: usize,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            cache: ShardedCache::new(capacity),
            filter_policy,
            block_cache,
        }
    }

    /// Get the open table for `file_number`, opening and caching it if
    /// needed.
    pub fn get(&self, file_number: u64) -> Result<Arc<Table>> {
        let key = file_number.to_le_bytes();
        if let Some(handle) = self.cache.lookup(&key) {
            return Ok(Arc::clone(handle.value()));
        }

        let table = Arc::new(self.open_table(file_number)?);
        let handle = self.cache.insert(
            Bytes::copy_from_slice(&key),
            Arc::clone(&table),
            1,
            None,
        );
        drop(handle);
        Ok(table)
    }

    /// Point lookup through the cached table.
    pub fn internal_get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let table = self.get(file_number)?;
        table.internal_get(options, internal_key)
    }

    /// Iterator over the table `file_number`.
    pub fn iter(&self, options: ReadOptions, file_number: u64) -> Result<TableIterator> {
        let table = self.get(file_number)?;
        Ok(table.iter(options))
    }

    /// Drop the cached reader for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number.to_le_bytes());
    }

    /// Shared operation counters.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }

    /// Open `NNNNNN.ldb`, falling back to the legacy `NNNNNN.sst`
    /// name.
    fn open_table(&self, file_number: u64) -> Result<Table> {
        let path = table_file_path(&self.db_path, file_number);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                File::open(legacy_table_file_path(&self.db_path, file_number))?
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        Table::open(
            file,
            size,
            self.filter_policy.clone(),
            self.block_cache.clone(),
        )
    }
}
