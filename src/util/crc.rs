//! CRC-32C (Castagnoli) checksum utilities.
//!
//! Stored checksums are masked so that data which embeds its own CRC
//! does not feed a raw CRC back into another CRC computation.

use crc::{Crc, Digest, CRC_32_ISCSI};

static CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Compute the CRC-32C checksum of the given data.
pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// Compute the CRC-32C checksum of multiple slices as one stream.
pub fn crc32c_multi(slices: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for slice in slices {
        digest.update(slice);
    }
    digest.finalize()
}

/// Mask a CRC value for storage: rotate right 15 bits, then add a
/// constant (mod 2^32).
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Unmask a masked CRC value (inverse of [`mask_crc`]).
pub fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Verify that data matches an expected masked CRC.
pub fn verify_masked_crc(data: &[u8], masked: u32) -> bool {
    crc32c(data) == unmask_crc(masked)
}

/// Incremental CRC-32C computation.
pub struct Crc32cBuilder {
    digest: Digest<'static, u32>,
}

impl Crc32cBuilder {
    /// Create a new incremental CRC builder.
    pub fn new() -> Self {
        Self {
            digest: CASTAGNOLI.digest(),
        }
    }

    /// Feed more data into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Finish and return the checksum.
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32cBuilder {
    fn default() -> Self {
        Self::new()
    }
}
