//! WAL writer implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::util::crc::{crc32c_multi, mask_crc};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Appends records to a log file using the block-framed format.
pub struct WalWriter {
    /// Buffered writer for the WAL file.
    writer: BufWriter<File>,
    /// Current position within the current block.
    block_offset: usize,
}

impl WalWriter {
    /// Create a new WAL at `path`, truncating any existing file.
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    /// Wrap an already positioned file. `block_offset` must be the
    /// file length modulo the block size when appending.
    pub fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE, file),
            block_offset: 0,
        }
    }

    /// Append one logical record.
    ///
    /// The record is split into as many physical records as needed to
    /// respect block boundaries.
    pub fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        // Empty records still emit a single zero-length Full record.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                // Not even a header fits; zero-fill the trailer and
                // start a new block.
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                break;
            }
        }

        Ok(())
    }

    /// Write a physical record (header + payload).
    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        // CRC covers the type byte then the payload; stored masked.
        let crc = mask_crc(crc32c_multi(&[&[record_type.to_byte()], data]));

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type.to_byte();

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    /// Flush buffered data to the OS without forcing it to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Force everything written so far to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flush, sync, and drop the writer.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}
