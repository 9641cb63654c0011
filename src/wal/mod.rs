//! Write-ahead log: durable record of writes used for crash recovery.
//!
//! The log is a sequence of 32KB blocks. Each physical record carries
//! a 7-byte header:
//!
//! ```text
//! masked CRC-32C (4 bytes) | length (2 bytes) | type (1 byte)
//! ```
//!
//! The CRC covers the type byte followed by the payload. A logical
//! record that fits the current block is written as one `Full` record;
//! otherwise it is fragmented into `First`, zero or more `Middle`, and
//! `Last` records across consecutive blocks. A block tail smaller than
//! a header is zero-filled.

mod reader;
mod writer;

pub use reader::{Reporter, WalReader};
pub use writer::WalWriter;

/// Size of a log block (32KB).
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Record header size: CRC (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// Record types for WAL entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated files; skipped on read.
    Zero = 0,
    /// Complete record in a single fragment.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment(s) of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
}

/// Largest valid record type value.
pub const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

impl RecordType {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}
