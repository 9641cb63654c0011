//! Block cache: decompressed table blocks, bounded by total byte size.

use std::sync::Arc;

use bytes::Bytes;

use crate::sstable::Block;

use super::lru::{CacheStats, ShardedCache};

/// Cache of decompressed data blocks.
///
/// Keys are `fixed64 cache_id || fixed64 block_offset`; every open
/// table draws a distinct cache id, which namespaces its blocks and
/// makes keys from deleted-then-reused file numbers unambiguous.
pub struct BlockCache {
    cache: ShardedCache<Arc<Block>>,
}

impl BlockCache {
    /// Create a block cache bounded to `capacity` bytes of block data.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: ShardedCache::new(capacity),
        }
    }

    /// Reserve a key-space id for one cache client (an open table).
    pub fn new_id(&self) -> u64 {
        self.cache.new_id()
    }

    /// Fetch the block at (`cache_id`, `offset`), if cached.
    pub fn get(&self, cache_id: u64, offset: u64) -> Option<Arc<Block>> {
        let handle = self.cache.lookup(&cache_key(cache_id, offset))?;
        Some(Arc::clone(handle.value()))
    }

    /// Insert a block, charged at its in-memory size.
    pub fn insert(&self, cache_id: u64, offset: u64, block: Arc<Block>) {
        let charge = block.size();
        let key = Bytes::copy_from_slice(&cache_key(cache_id, offset));
        drop(self.cache.insert(key, block, charge, None));
    }

    /// Total bytes of cached block data.
    pub fn total_charge(&self) -> usize {
        self.cache.total_charge()
    }

    /// Shared operation counters.
    pub fn stats(&self) -> Arc<CacheStats> {
        self.cache.stats()
    }
}

fn cache_key(cache_id: u64, offset: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&cache_id.to_le_bytes());
    key[8..].copy_from_slice(&offset.to_le_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::BlockBuilder;

    fn test_block(tag: &[u8]) -> Arc<Block> {
        let mut builder = BlockBuilder::new(16);
        builder.add(tag, b"value");
        Arc::new(Block::new(builder.finish()).unwrap())
    }

    #[test]
    fn test_get_miss_then_hit() {
        let cache = BlockCache::new(1 << 20);
        let id = cache.new_id();

        assert!(cache.get(id, 0).is_none());

        let block = test_block(b"key");
        cache.insert(id, 0, Arc::clone(&block));

        let cached = cache.get(id, 0).unwrap();
        assert!(Arc::ptr_eq(&cached, &block));
    }

    #[test]
    fn test_ids_partition_key_space() {
        let cache = BlockCache::new(1 << 20);
        let id1 = cache.new_id();
        let id2 = cache.new_id();

        cache.insert(id1, 0, test_block(b"one"));
        assert!(cache.get(id1, 0).is_some());
        assert!(cache.get(id2, 0).is_none());
    }

    #[test]
    fn test_charge_tracks_block_size() {
        let cache = BlockCache::new(1 << 20);
        let id = cache.new_id();

        let block = test_block(b"key");
        let size = block.size();
        cache.insert(id, 0, block);
        assert_eq!(cache.total_charge(), size);
    }
}
