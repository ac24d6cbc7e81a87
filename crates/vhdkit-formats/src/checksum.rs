//! Checksum primitives used by the VHD and VHDX containers
//!
//! VHDX protects its header, region table and metadata structures with
//! CRC-32C (Castagnoli). The legacy VHD footer and dynamic header use a
//! one's-complement byte sum instead.

use crc::{Crc, CRC_32_ISCSI};

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// CRC-32C (Castagnoli) over `data`
///
/// Polynomial `0x1EDC6F41` in reflected form `0x82F63B78`, initial value
/// `0xFFFFFFFF`, final XOR `0xFFFFFFFF`. Structures that embed their own
/// checksum are verified by zeroing the four checksum bytes first; see
/// [`crc32c_with_zeroed_field`].
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

/// CRC-32C over `data` with the four bytes at `field_offset` treated as zero
///
/// This is how VHDX computes the stored checksum of a structure: the
/// checksum field participates in the computation as zeros.
pub fn crc32c_with_zeroed_field(data: &[u8], field_offset: usize) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(&data[..field_offset]);
    digest.update(&[0u8; 4]);
    digest.update(&data[field_offset + 4..]);
    digest.finalize()
}

/// One's-complement byte sum used by the VHD footer and dynamic header
///
/// The four checksum bytes at `field_offset` are skipped during the sum.
pub fn ones_complement_sum(data: &[u8], field_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if (field_offset..field_offset + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(byte as u32);
    }
    !sum
}
