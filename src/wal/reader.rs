//! WAL reader implementation.
//!
//! Corruption inside a block is reported through the [`Reporter`] and
//! the rest of the block is dropped; reading then continues with the
//! next block. Truncation at the file tail reads as a clean EOF.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;

use crate::error::Result;
use crate::util::coding::read_fixed32;
use crate::util::crc::{crc32c_multi, unmask_crc};

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};

/// Receives reports of bytes dropped due to corruption.
pub trait Reporter {
    /// Some bytes (approximately `bytes`) were skipped for `reason`.
    fn corruption(&mut self, bytes: u64, reason: &str);
}

/// Outcome of reading one physical record.
enum Physical {
    Record(RecordType, Bytes),
    Eof,
    Bad,
}

/// Reads logical records back out of a WAL file.
pub struct WalReader {
    file: File,
    reporter: Option<Box<dyn Reporter + Send>>,
    /// Verify record CRCs.
    checksum: bool,
    /// Block-sized read buffer; `buf_start..buf_end` is unconsumed.
    buf: Vec<u8>,
    buf_start: usize,
    buf_end: usize,
    /// Last read hit the end of the file.
    eof: bool,
    /// File offset of the first record returned by `read_record`.
    last_record_offset: u64,
    /// File offset one past the end of the buffer.
    end_of_buffer_offset: u64,
    /// Skip records positioned before this file offset.
    initial_offset: u64,
    /// Dropping fragments until the next First/Full record after a
    /// seek to `initial_offset`.
    resyncing: bool,
}

impl WalReader {
    /// Create a reader over `file` starting at `initial_offset`.
    pub fn new(
        file: File,
        reporter: Option<Box<dyn Reporter + Send>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            buf: vec![0u8; BLOCK_SIZE],
            buf_start: 0,
            buf_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Open the log at `path` with checksum verification on.
    pub fn open(path: &Path, reporter: Option<Box<dyn Reporter + Send>>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(file, reporter, true, 0))
    }

    /// File offset of the last record returned by `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Read the next logical record, reassembling fragments.
    ///
    /// Returns None at end of file. Corrupt stretches are reported and
    /// skipped rather than surfaced as errors.
    pub fn read_record(&mut self) -> Option<Bytes> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the First fragment of the record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            match self.read_physical_record() {
                Physical::Record(record_type, fragment) => {
                    let physical_record_offset = self.end_of_buffer_offset
                        - (self.buf_end - self.buf_start) as u64
                        - HEADER_SIZE as u64
                        - fragment.len() as u64;

                    if self.resyncing {
                        match record_type {
                            RecordType::Middle => continue,
                            RecordType::Last => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    match record_type {
                        RecordType::Full => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(1)",
                                );
                            }
                            self.last_record_offset = physical_record_offset;
                            return Some(fragment);
                        }
                        RecordType::First => {
                            if in_fragmented_record && !scratch.is_empty() {
                                self.report_corruption(
                                    scratch.len() as u64,
                                    "partial record without end(2)",
                                );
                            }
                            prospective_record_offset = physical_record_offset;
                            scratch.clear();
                            scratch.extend_from_slice(&fragment);
                            in_fragmented_record = true;
                        }
                        RecordType::Middle => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment.len() as u64,
                                    "missing start of fragmented record(1)",
                                );
                            } else {
                                scratch.extend_from_slice(&fragment);
                            }
                        }
                        RecordType::Last => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    fragment.len() as u64,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                scratch.extend_from_slice(&fragment);
                                self.last_record_offset = prospective_record_offset;
                                return Some(Bytes::from(scratch));
                            }
                        }
                        // read_physical_record never returns Zero
                        RecordType::Zero => unreachable!(),
                    }
                }
                Physical::Eof => {
                    // A fragmented record cut off by EOF means the
                    // writer died mid-record; drop it silently.
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(
                            scratch.len() as u64,
                            "error in middle of record",
                        );
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    /// Skip ahead to the block containing `initial_offset`.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = (self.initial_offset % BLOCK_SIZE as u64) as usize;
        let mut block_start = self.initial_offset - offset_in_block as u64;

        // Offsets inside the zero-filled trailer belong to the next
        // block.
        if offset_in_block > BLOCK_SIZE - 6 {
            block_start += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start;

        if block_start > 0 {
            if let Err(err) = self.file.seek(SeekFrom::Start(block_start)) {
                self.report_drop(block_start, &err.to_string());
                return false;
            }
        }
        true
    }

    /// Read the next physical record out of the buffered block.
    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buf_end - self.buf_start < HEADER_SIZE {
                if !self.eof {
                    // Last read was a full block; get the next one.
                    self.buf_start = 0;
                    self.buf_end = 0;
                    match read_full(&mut self.file, &mut self.buf) {
                        Ok(n) => {
                            self.end_of_buffer_offset += n as u64;
                            self.buf_end = n;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                            if n == 0 {
                                return Physical::Eof;
                            }
                        }
                        Err(err) => {
                            self.report_drop(BLOCK_SIZE as u64, &err.to_string());
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                }
                // Truncated header at the tail of the file; the writer
                // died mid-header. Not corruption.
                self.buf_start = self.buf_end;
                return Physical::Eof;
            }

            let header = &self.buf[self.buf_start..self.buf_start + HEADER_SIZE];
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if HEADER_SIZE + length > self.buf_end - self.buf_start {
                let drop_size = (self.buf_end - self.buf_start) as u64;
                self.buf_start = self.buf_end;
                if !self.eof {
                    self.report_drop(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // Truncated record at the tail: the writer died while
                // writing it. Not corruption.
                return Physical::Eof;
            }

            if type_byte == RecordType::Zero.to_byte() && length == 0 {
                // Zero-filled preallocation artifact; skip the rest of
                // the block without reporting.
                self.buf_start = self.buf_end;
                return Physical::Bad;
            }

            if self.checksum {
                let expected = unmask_crc(read_fixed32(header).unwrap_or(0));
                let payload_start = self.buf_start + HEADER_SIZE;
                let actual = crc32c_multi(&[
                    &[type_byte],
                    &self.buf[payload_start..payload_start + length],
                ]);
                if actual != expected {
                    let drop_size = (self.buf_end - self.buf_start) as u64;
                    self.buf_start = self.buf_end;
                    self.report_drop(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            if type_byte > MAX_RECORD_TYPE {
                let drop_size = (self.buf_end - self.buf_start) as u64;
                self.buf_start = self.buf_end;
                self.report_drop(drop_size, "unknown record type");
                return Physical::Bad;
            }

            let payload_start = self.buf_start + HEADER_SIZE;
            self.buf_start = payload_start + length;

            // Skip physical records that ended before initial_offset.
            if (self.end_of_buffer_offset
                - (self.buf_end - self.buf_start) as u64
                - HEADER_SIZE as u64
                - length as u64)
                < self.initial_offset
            {
                return Physical::Bad;
            }

            let record_type = RecordType::from_byte(type_byte).unwrap_or(RecordType::Zero);
            if record_type == RecordType::Zero {
                // Zero-type with a payload: treat like any other
                // corrupt record.
                self.report_drop(length as u64, "zero record type with payload");
                return Physical::Bad;
            }

            let fragment = Bytes::copy_from_slice(&self.buf[payload_start..payload_start + length]);
            return Physical::Record(record_type, fragment);
        }
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: u64, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes, reason);
        }
    }
}

/// Read until `buf` is full or EOF; returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
