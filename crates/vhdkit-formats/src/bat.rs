//! Block allocation tables
//!
//! Both container generations map logical block indices to physical file
//! offsets through a table, but the encodings differ: VHD stores 32-bit
//! big-endian sector numbers, VHDX stores 64-bit little-endian entries with a
//! 3-bit state field and interleaved sector-bitmap entries. Both are loaded
//! here into one resident [`BlockAllocationTable`] of [`BlockState`] values so
//! the resolver never touches the wire encodings again.

use tracing::debug;
use vhdkit_core::{ByteSource, Error, Result};

/// VHD table entry marking an unallocated block
pub const VHD_UNALLOCATED: u32 = 0xFFFF_FFFF;

/// VHDX payload block states (low 3 bits of a BAT entry)
pub const VHDX_BLOCK_NOT_PRESENT: u64 = 0;
pub const VHDX_BLOCK_UNDEFINED: u64 = 1;
pub const VHDX_BLOCK_ZERO: u64 = 2;
pub const VHDX_BLOCK_UNMAPPED: u64 = 3;
pub const VHDX_BLOCK_FULLY_PRESENT: u64 = 6;
pub const VHDX_BLOCK_PARTIALLY_PRESENT: u64 = 7;

/// VHDX sector-bitmap entry state marking the bitmap block as present
pub const VHDX_SB_BLOCK_PRESENT: u64 = 6;

/// Mask extracting the MiB-aligned physical offset from a VHDX BAT entry
const VHDX_OFFSET_MASK: u64 = 0xFFFF_FFFF_FFF0_0000;

/// Bit numbering inside a sector bitmap byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// Bit 7 of byte 0 is sector 0 (VHD)
    Msb0,
    /// Bit 0 of byte 0 is sector 0 (VHDX)
    Lsb0,
}

/// Per-sector presence bitmap, one bit per logical sector
///
/// A set bit means the sector comes from this image; a clear bit defers to
/// the parent image.
#[derive(Debug, Clone)]
pub struct SectorBitmap {
    data: Vec<u8>,
    order: BitOrder,
    sector_count: u32,
}

impl SectorBitmap {
    /// Wrap raw bitmap bytes covering `sector_count` sectors
    pub fn new(data: Vec<u8>, order: BitOrder, sector_count: u32) -> Self {
        debug_assert!(data.len() * 8 >= sector_count as usize);
        Self {
            data,
            order,
            sector_count,
        }
    }

    /// Number of sectors covered
    pub fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Whether the bit for `sector` is set
    pub fn is_set(&self, sector: u32) -> bool {
        debug_assert!(sector < self.sector_count);
        let byte = self.data[(sector / 8) as usize];
        let bit = match self.order {
            BitOrder::Msb0 => (byte >> (7 - (sector % 8))) & 1,
            BitOrder::Lsb0 => (byte >> (sector % 8)) & 1,
        };
        bit == 1
    }

    /// Length of the maximal run of equal bits starting at `sector`
    pub fn run_length(&self, sector: u32) -> u32 {
        let value = self.is_set(sector);
        let mut end = sector + 1;
        while end < self.sector_count && self.is_set(end) == value {
            end += 1;
        }
        end - sector
    }
}

/// State of one logical block
#[derive(Debug, Clone)]
pub enum BlockState {
    /// No data in this image; zeros for dynamic images, parent data for
    /// differential images
    NotPresent,
    /// Block data sits contiguously at this physical file offset
    Present(u64),
    /// Explicit zero fill, regardless of any parent
    Zero,
    /// Per-sector mix of this image and the parent
    PartiallyPresent {
        /// Physical offset of the block payload
        offset: u64,
        /// One bit per logical sector: set = this image, clear = parent
        bitmap: SectorBitmap,
    },
}

/// Resident block allocation table
///
/// Built once at load time; immutable afterwards. Exposes a single read
/// operation, [`BlockAllocationTable::state_of`].
pub struct BlockAllocationTable {
    states: Vec<BlockState>,
    block_size: u32,
}

impl BlockAllocationTable {
    /// Allocation unit covered by one entry, in bytes
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of payload entries
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State of the block at `block_index`
    ///
    /// Indices beyond the table read as [`BlockState::NotPresent`].
    pub fn state_of(&self, block_index: u64) -> &BlockState {
        static NOT_PRESENT: BlockState = BlockState::NotPresent;
        self.states
            .get(block_index as usize)
            .unwrap_or(&NOT_PRESENT)
    }

    /// Load a VHD block allocation table
    ///
    /// `entry_count` blocks are read from the 32-bit big-endian sector-number
    /// array at `table_offset`. Every allocated block is preceded on disk by
    /// a sector bitmap; for dynamic images the bitmap is skipped and all
    /// sectors are treated as present, for differencing images it is loaded
    /// and drives per-sector parent deferral.
    pub fn load_vhd(
        source: &mut dyn ByteSource,
        table_offset: u64,
        entry_count: u32,
        block_size: u32,
        differencing: bool,
    ) -> Result<Self> {
        let sectors_per_block = block_size / 512;
        let bitmap_size = u64::from((sectors_per_block.div_ceil(8)).div_ceil(512) * 512);

        let mut table_data = vec![0u8; entry_count as usize * 4];
        source.read_exact_at(table_offset, &mut table_data)?;

        debug!(
            table_offset,
            entry_count, block_size, "loaded VHD block allocation table"
        );

        let source_size = source.size();
        let mut states = Vec::with_capacity(entry_count as usize);

        for index in 0..entry_count as usize {
            let sector_number = u32::from_be_bytes([
                table_data[index * 4],
                table_data[index * 4 + 1],
                table_data[index * 4 + 2],
                table_data[index * 4 + 3],
            ]);

            if sector_number == VHD_UNALLOCATED {
                states.push(BlockState::NotPresent);
                continue;
            }

            let bitmap_offset = u64::from(sector_number) * 512;
            let payload_offset = bitmap_offset + bitmap_size;

            if payload_offset + u64::from(block_size) > source_size {
                return Err(Error::malformed(format!(
                    "block {} payload at offset {} extends beyond file size {}",
                    index, payload_offset, source_size
                )));
            }

            if differencing {
                let mut bitmap_data = vec![0u8; bitmap_size as usize];
                source.read_exact_at(bitmap_offset, &mut bitmap_data)?;

                states.push(BlockState::PartiallyPresent {
                    offset: payload_offset,
                    bitmap: SectorBitmap::new(bitmap_data, BitOrder::Msb0, sectors_per_block),
                });
            } else {
                // The bitmap of a dynamic image is advisory only; all
                // sectors are treated as present.
                states.push(BlockState::Present(payload_offset));
            }
        }

        Ok(Self { states, block_size })
    }

    /// Load a VHDX block allocation table
    ///
    /// The table interleaves a sector-bitmap entry after every `chunk_ratio`
    /// payload entries, where `chunk_ratio = (2^23 * bytes_per_sector) /
    /// block_size`. Payload entries carry a 3-bit state and a MiB-aligned
    /// physical offset. For partially-present blocks the matching slice of
    /// the chunk's 1 MiB sector-bitmap block is loaded eagerly.
    pub fn load_vhdx(
        source: &mut dyn ByteSource,
        table_offset: u64,
        table_length: u64,
        block_size: u32,
        bytes_per_sector: u32,
        media_size: u64,
        differencing: bool,
    ) -> Result<Self> {
        let chunk_ratio = ((1u64 << 23) * u64::from(bytes_per_sector)) / u64::from(block_size);
        let payload_count = media_size.div_ceil(u64::from(block_size));
        let chunk_count = payload_count.div_ceil(chunk_ratio);
        let total_entries = chunk_count * (chunk_ratio + 1);

        let available_entries = table_length / 8;
        if available_entries < total_entries {
            return Err(Error::malformed(format!(
                "block allocation table has {} entries, {} required for media size {}",
                available_entries, total_entries, media_size
            )));
        }

        let mut table_data = vec![0u8; (total_entries * 8) as usize];
        source.read_exact_at(table_offset, &mut table_data)?;

        debug!(
            table_offset,
            payload_count, chunk_ratio, "loaded VHDX block allocation table"
        );

        let entry_at = |index: u64| -> u64 {
            let start = (index * 8) as usize;
            u64::from_le_bytes(table_data[start..start + 8].try_into().unwrap())
        };

        let sectors_per_block = block_size / bytes_per_sector;
        let bitmap_slice_size = (1u64 << 20) / chunk_ratio;
        let source_size = source.size();

        let mut states = Vec::with_capacity(payload_count as usize);

        for block in 0..payload_count {
            let table_index = (block / chunk_ratio) * (chunk_ratio + 1) + (block % chunk_ratio);
            let entry = entry_at(table_index);
            let state = entry & 0x7;
            let offset = entry & VHDX_OFFSET_MASK;

            let check_offset = |offset: u64| -> Result<u64> {
                if offset == 0 {
                    return Err(Error::malformed(format!(
                        "block {} has a present state but a zero physical offset",
                        block
                    )));
                }
                if offset + u64::from(block_size) > source_size {
                    return Err(Error::malformed(format!(
                        "block {} payload at offset {} extends beyond file size {}",
                        block, offset, source_size
                    )));
                }
                Ok(offset)
            };

            match state {
                VHDX_BLOCK_ZERO => states.push(BlockState::Zero),
                VHDX_BLOCK_FULLY_PRESENT => {
                    states.push(BlockState::Present(check_offset(offset)?));
                }
                VHDX_BLOCK_PARTIALLY_PRESENT if differencing => {
                    let offset = check_offset(offset)?;

                    let bitmap_index = (block / chunk_ratio) * (chunk_ratio + 1) + chunk_ratio;
                    let bitmap_entry = entry_at(bitmap_index);
                    if bitmap_entry & 0x7 != VHDX_SB_BLOCK_PRESENT {
                        return Err(Error::malformed(format!(
                            "block {} is partially present but its sector bitmap is not",
                            block
                        )));
                    }
                    let bitmap_block_offset = bitmap_entry & VHDX_OFFSET_MASK;
                    let slice_offset =
                        bitmap_block_offset + (block % chunk_ratio) * bitmap_slice_size;

                    let mut bitmap_data = vec![0u8; bitmap_slice_size as usize];
                    source.read_exact_at(slice_offset, &mut bitmap_data)?;

                    states.push(BlockState::PartiallyPresent {
                        offset,
                        bitmap: SectorBitmap::new(bitmap_data, BitOrder::Lsb0, sectors_per_block),
                    });
                }
                VHDX_BLOCK_PARTIALLY_PRESENT => {
                    // Without a parent there is nothing to mix with; the
                    // payload is authoritative for the whole block.
                    states.push(BlockState::Present(check_offset(offset)?));
                }
                // NOT_PRESENT, UNDEFINED, UNMAPPED and reserved states all
                // defer to the parent (differential) or read as zeros.
                _ => states.push(BlockState::NotPresent),
            }
        }

        Ok(Self { states, block_size })
    }

    #[cfg(test)]
    pub(crate) fn from_states(states: Vec<BlockState>, block_size: u32) -> Self {
        Self { states, block_size }
    }
}
