//! Configuration options for stratadb.

/// Default target size for uncompressed data blocks (4KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Default number of entries between restart points in a block.
pub const DEFAULT_RESTART_INTERVAL: usize = 16;

/// Default memtable size before it is frozen and flushed (4MB).
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default block cache capacity in bytes (8MB).
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 8 * 1024 * 1024;

/// Default bloom filter bits per key.
pub const DEFAULT_BLOOM_BITS_PER_KEY: usize = 10;

/// Default cap on open table files.
pub const DEFAULT_MAX_OPEN_FILES: usize = 1000;

/// Compression applied to table blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    /// No compression.
    None = 0,
    /// Snappy compression (fast, modest ratio).
    #[default]
    Snappy = 1,
}

impl Compression {
    /// Create from the on-disk tag byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Compression::None),
            1 => Some(Compression::Snappy),
            _ => None,
        }
    }

    /// Convert to the on-disk tag byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Engine configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Amount of data to build up in the memtable before freezing it.
    pub write_buffer_size: usize,

    /// Approximate size of user data packed per data block.
    pub block_size: usize,

    /// Number of keys between restart points for prefix compression.
    pub block_restart_interval: usize,

    /// Compression applied to data blocks.
    pub compression: Compression,

    /// Bloom filter bits per key; 0 disables the filter block.
    pub bloom_bits_per_key: usize,

    /// Block cache capacity in bytes; 0 disables the block cache.
    pub block_cache_size: usize,

    /// Maximum number of open table files.
    pub max_open_files: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            block_restart_interval: DEFAULT_RESTART_INTERVAL,
            compression: Compression::Snappy,
            bloom_bits_per_key: DEFAULT_BLOOM_BITS_PER_KEY,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

/// Options for read operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,

    /// Whether blocks read by this operation populate the block
    /// cache. Turn off for bulk scans.
    pub fill_cache: bool,

    /// Read as of this sequence number instead of the latest state.
    pub snapshot: Option<u64>,
}

impl ReadOptions {
    /// Read options with cache fill enabled (the common case).
    pub fn new() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }

    /// Read options pinned at a snapshot sequence.
    pub fn at_snapshot(snapshot: u64) -> Self {
        Self {
            snapshot: Some(snapshot),
            ..Self::new()
        }
    }
}

/// Options for write operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the WAL to stable storage before the write returns.
    pub sync: bool,
}
