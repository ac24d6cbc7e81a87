//! VHDX on-disk structures
//!
//! A VHDX file opens with a file type identifier at offset 0, a pair of
//! 4 KiB headers at 64 KiB and 128 KiB, and a pair of 64 KiB region tables
//! at 192 KiB and 256 KiB. The region table locates the block allocation
//! table and the metadata region; the metadata region carries the virtual
//! disk parameters as a table of GUID-keyed items. All multi-byte fields are
//! little-endian, and every anchor structure is protected by CRC-32C.

use crate::checksum;
use std::collections::HashMap;
use vhdkit_core::{Error, Guid, Result};

/// Fixed offsets of the anchor structures
pub const HEADER_1_OFFSET: u64 = 0x10000;
pub const HEADER_2_OFFSET: u64 = 0x20000;
pub const REGION_TABLE_1_OFFSET: u64 = 0x30000;
pub const REGION_TABLE_2_OFFSET: u64 = 0x40000;

/// Size of one header structure
pub const HEADER_SIZE: usize = 4096;
/// Size of one region table
pub const REGION_TABLE_SIZE: usize = 65536;

/// Region GUIDs
pub const BAT_REGION_GUID: Guid = Guid::from_bytes([
    0x2D, 0xC2, 0x77, 0x66, 0xF6, 0x23, 0x42, 0x00, 0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD, 0x4A, 0x08,
]);
pub const METADATA_REGION_GUID: Guid = Guid::from_bytes([
    0x8B, 0x7C, 0xA2, 0x06, 0x47, 0x90, 0x4B, 0x9A, 0xB8, 0xFE, 0x57, 0x5F, 0x05, 0x0F, 0x88, 0x6E,
]);

/// Metadata item GUIDs
pub const FILE_PARAMETERS_GUID: Guid = Guid::from_bytes([
    0xCA, 0xA1, 0x67, 0x37, 0xFA, 0x36, 0x4D, 0x43, 0xB3, 0xB6, 0x33, 0xF0, 0xAA, 0x44, 0xE7, 0x6B,
]);
pub const VIRTUAL_DISK_SIZE_GUID: Guid = Guid::from_bytes([
    0x2F, 0xA5, 0x42, 0x24, 0xCD, 0x1B, 0x48, 0x76, 0xB2, 0x11, 0x5D, 0xBE, 0xD8, 0x3B, 0xF4, 0xB8,
]);
pub const VIRTUAL_DISK_ID_GUID: Guid = Guid::from_bytes([
    0xBE, 0xCA, 0x12, 0xAB, 0xB2, 0xE6, 0x45, 0x23, 0x93, 0xEF, 0xC3, 0x09, 0xE0, 0x00, 0xC7, 0x46,
]);
pub const LOGICAL_SECTOR_SIZE_GUID: Guid = Guid::from_bytes([
    0x81, 0x41, 0xBF, 0x1D, 0xA9, 0x6F, 0x47, 0x09, 0xBA, 0x47, 0xF2, 0x33, 0xA8, 0xFA, 0xAB, 0x5F,
]);
pub const PHYSICAL_SECTOR_SIZE_GUID: Guid = Guid::from_bytes([
    0xCD, 0xA3, 0x48, 0xC7, 0x44, 0x5D, 0x44, 0x71, 0x9C, 0xC9, 0xE9, 0x88, 0x52, 0x51, 0xC5, 0x56,
]);
pub const PARENT_LOCATOR_GUID: Guid = Guid::from_bytes([
    0xA8, 0xD3, 0x5F, 0x2D, 0xB3, 0x0B, 0x45, 0x4D, 0xAB, 0xF7, 0xD3, 0xD8, 0x48, 0x34, 0xAB, 0x0C,
]);

/// Parent locator type for VHDX parents
pub const VHDX_PARENT_LOCATOR_TYPE: Guid = Guid::from_bytes([
    0xB0, 0x4A, 0xEF, 0xB7, 0xD1, 0x9E, 0x4A, 0x81, 0xB7, 0x89, 0x25, 0xB8, 0xE9, 0x44, 0x59, 0x13,
]);

/// File type identifier at offset 0
#[derive(Debug, Clone)]
pub struct VhdxFileTypeIdentifier {
    /// Creator string, advisory only
    pub creator: String,
}

impl VhdxFileTypeIdentifier {
    /// Signature value
    pub const SIGNATURE: &'static [u8; 8] = b"vhdxfile";

    /// Bytes consumed from the start of the file
    pub const SIZE: usize = 8 + 512;

    /// Parse the file type identifier
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("VHDX file type identifier too small"));
        }
        if &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::signature_mismatch(format!(
                "expected VHDX signature 'vhdxfile', got '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }
        Ok(Self {
            creator: decode_utf16le(&bytes[8..Self::SIZE]).unwrap_or_default(),
        })
    }
}

/// One slot of the VHDX header pair (4 KiB)
#[derive(Debug, Clone)]
pub struct VhdxHeader {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_guid: Guid,
    pub data_write_guid: Guid,
    pub log_guid: Guid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    /// Signature value
    pub const SIGNATURE: &'static [u8; 4] = b"head";

    /// Byte offset of the checksum field
    const CHECKSUM_OFFSET: usize = 4;

    /// Parse and verify one header slot
    ///
    /// The CRC-32C covers the whole 4 KiB structure with the checksum field
    /// taken as zero.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::malformed("VHDX header too small"));
        }
        if &bytes[0..4] != Self::SIGNATURE {
            return Err(Error::signature_mismatch(format!(
                "expected VHDX header signature 'head', got '{}'",
                String::from_utf8_lossy(&bytes[0..4])
            )));
        }

        let checksum = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let computed = checksum::crc32c_with_zeroed_field(&bytes[..HEADER_SIZE], Self::CHECKSUM_OFFSET);
        if checksum != computed {
            return Err(Error::checksum_mismatch(format!(
                "VHDX header checksum is {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let version = u16::from_le_bytes(bytes[66..68].try_into().unwrap());
        if version != 1 {
            return Err(Error::unsupported(format!("VHDX header version {}", version)));
        }

        Ok(Self {
            checksum,
            sequence_number: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            file_write_guid: Guid::from_le_bytes(bytes[16..32].try_into().unwrap()),
            data_write_guid: Guid::from_le_bytes(bytes[32..48].try_into().unwrap()),
            log_guid: Guid::from_le_bytes(bytes[48..64].try_into().unwrap()),
            log_version: u16::from_le_bytes(bytes[64..66].try_into().unwrap()),
            version,
            log_length: u32::from_le_bytes(bytes[68..72].try_into().unwrap()),
            log_offset: u64::from_le_bytes(bytes[72..80].try_into().unwrap()),
        })
    }

    /// Serialize one header slot, computing a fresh checksum
    ///
    /// Used by synthetic-image construction in tests.
    pub fn serialize(&self, bytes: &mut [u8; HEADER_SIZE]) {
        bytes.fill(0);
        bytes[0..4].copy_from_slice(Self::SIGNATURE);
        bytes[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.file_write_guid.to_le_bytes());
        bytes[32..48].copy_from_slice(&self.data_write_guid.to_le_bytes());
        bytes[48..64].copy_from_slice(&self.log_guid.to_le_bytes());
        bytes[64..66].copy_from_slice(&self.log_version.to_le_bytes());
        bytes[66..68].copy_from_slice(&self.version.to_le_bytes());
        bytes[68..72].copy_from_slice(&self.log_length.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.log_offset.to_le_bytes());

        let checksum = checksum::crc32c_with_zeroed_field(bytes, Self::CHECKSUM_OFFSET);
        bytes[4..8].copy_from_slice(&checksum.to_le_bytes());
    }
}

/// One region table entry
#[derive(Debug, Clone, Copy)]
pub struct VhdxRegionTableEntry {
    pub guid: Guid,
    pub file_offset: u64,
    pub length: u32,
    pub required: bool,
}

/// Region table (64 KiB), locating the BAT and metadata regions
#[derive(Debug, Clone)]
pub struct VhdxRegionTable {
    pub entries: Vec<VhdxRegionTableEntry>,
}

impl VhdxRegionTable {
    /// Signature value
    pub const SIGNATURE: &'static [u8; 4] = b"regi";

    /// Maximum number of entries
    pub const MAX_ENTRIES: u32 = 2047;

    /// Byte offset of the checksum field
    const CHECKSUM_OFFSET: usize = 4;

    /// Parse and verify a region table
    ///
    /// Unknown regions flagged as required fail the load; unknown optional
    /// regions are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REGION_TABLE_SIZE {
            return Err(Error::malformed("VHDX region table too small"));
        }
        if &bytes[0..4] != Self::SIGNATURE {
            return Err(Error::signature_mismatch(format!(
                "expected VHDX region table signature 'regi', got '{}'",
                String::from_utf8_lossy(&bytes[0..4])
            )));
        }

        let checksum = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let computed =
            checksum::crc32c_with_zeroed_field(&bytes[..REGION_TABLE_SIZE], Self::CHECKSUM_OFFSET);
        if checksum != computed {
            return Err(Error::checksum_mismatch(format!(
                "VHDX region table checksum is {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let entry_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if entry_count > Self::MAX_ENTRIES {
            return Err(Error::malformed(format!(
                "region table declares {} entries, at most {} allowed",
                entry_count,
                Self::MAX_ENTRIES
            )));
        }

        let mut entries = Vec::with_capacity(entry_count as usize);
        for index in 0..entry_count as usize {
            let offset = 16 + index * 32;
            let entry = VhdxRegionTableEntry {
                guid: Guid::from_le_bytes(bytes[offset..offset + 16].try_into().unwrap()),
                file_offset: u64::from_le_bytes(bytes[offset + 16..offset + 24].try_into().unwrap()),
                length: u32::from_le_bytes(bytes[offset + 24..offset + 28].try_into().unwrap()),
                required: u32::from_le_bytes(bytes[offset + 28..offset + 32].try_into().unwrap())
                    & 1
                    != 0,
            };

            if entry.required && entry.guid != BAT_REGION_GUID && entry.guid != METADATA_REGION_GUID
            {
                return Err(Error::unsupported(format!(
                    "unknown required region {}",
                    entry.guid
                )));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Find a region by its GUID
    pub fn region(&self, guid: Guid) -> Option<&VhdxRegionTableEntry> {
        self.entries.iter().find(|entry| entry.guid == guid)
    }

    /// Serialize a region table, computing a fresh checksum
    ///
    /// Used by synthetic-image construction in tests.
    pub fn serialize(&self, bytes: &mut [u8]) {
        bytes[..REGION_TABLE_SIZE].fill(0);
        bytes[0..4].copy_from_slice(Self::SIGNATURE);
        bytes[8..12].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (index, entry) in self.entries.iter().enumerate() {
            let offset = 16 + index * 32;
            bytes[offset..offset + 16].copy_from_slice(&entry.guid.to_le_bytes());
            bytes[offset + 16..offset + 24].copy_from_slice(&entry.file_offset.to_le_bytes());
            bytes[offset + 24..offset + 28].copy_from_slice(&entry.length.to_le_bytes());
            bytes[offset + 28..offset + 32]
                .copy_from_slice(&u32::from(entry.required).to_le_bytes());
        }

        let checksum =
            checksum::crc32c_with_zeroed_field(&bytes[..REGION_TABLE_SIZE], Self::CHECKSUM_OFFSET);
        bytes[4..8].copy_from_slice(&checksum.to_le_bytes());
    }
}

/// One metadata table entry
#[derive(Debug, Clone, Copy)]
pub struct VhdxMetadataEntry {
    pub item_id: Guid,
    /// Offset of the item data relative to the metadata region start
    pub offset: u32,
    pub length: u32,
    pub is_user: bool,
    pub is_virtual_disk: bool,
    pub is_required: bool,
}

/// Metadata table header and entries
#[derive(Debug, Clone)]
pub struct VhdxMetadataTable {
    pub entries: Vec<VhdxMetadataEntry>,
}

impl VhdxMetadataTable {
    /// Signature value
    pub const SIGNATURE: &'static [u8; 8] = b"metadata";

    /// Maximum number of entries
    pub const MAX_ENTRIES: u16 = 2047;

    /// Size of the table header
    pub const HEADER_SIZE: usize = 32;

    /// Parse the metadata table from the start of the metadata region
    ///
    /// `region_length` bounds the item offsets; an item pointing outside its
    /// region fails the load.
    pub fn parse(bytes: &[u8], region_length: u32) -> Result<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(Error::malformed("VHDX metadata table too small"));
        }
        if &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::signature_mismatch(format!(
                "expected VHDX metadata signature 'metadata', got '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let entry_count = u16::from_le_bytes(bytes[10..12].try_into().unwrap());
        if entry_count > Self::MAX_ENTRIES {
            return Err(Error::malformed(format!(
                "metadata table declares {} entries, at most {} allowed",
                entry_count,
                Self::MAX_ENTRIES
            )));
        }
        let table_end = Self::HEADER_SIZE + usize::from(entry_count) * 32;
        if bytes.len() < table_end {
            return Err(Error::malformed("VHDX metadata table truncated"));
        }

        let mut entries = Vec::with_capacity(usize::from(entry_count));
        for index in 0..usize::from(entry_count) {
            let offset = Self::HEADER_SIZE + index * 32;
            let flags = u32::from_le_bytes(bytes[offset + 24..offset + 28].try_into().unwrap());
            let entry = VhdxMetadataEntry {
                item_id: Guid::from_le_bytes(bytes[offset..offset + 16].try_into().unwrap()),
                offset: u32::from_le_bytes(bytes[offset + 16..offset + 20].try_into().unwrap()),
                length: u32::from_le_bytes(bytes[offset + 20..offset + 24].try_into().unwrap()),
                is_user: flags & 0x1 != 0,
                is_virtual_disk: flags & 0x2 != 0,
                is_required: flags & 0x4 != 0,
            };

            if entry.length > 0
                && (u64::from(entry.offset) + u64::from(entry.length) > u64::from(region_length))
            {
                return Err(Error::malformed(format!(
                    "metadata item {} extends beyond its region",
                    entry.item_id
                )));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }
}

/// Virtual disk file parameters metadata item
#[derive(Debug, Clone, Copy)]
pub struct VhdxFileParameters {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
}

impl VhdxFileParameters {
    /// Size of the item data
    pub const SIZE: usize = 8;

    /// Parse the file parameters item
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("VHDX file parameters item too small"));
        }
        let flags = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Ok(Self {
            block_size: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            leave_blocks_allocated: flags & 0x1 != 0,
            has_parent: flags & 0x2 != 0,
        })
    }
}

/// Parent locator metadata item: a small key-value table
#[derive(Debug, Clone)]
pub struct VhdxParentLocator {
    pub entries: HashMap<String, String>,
}

impl VhdxParentLocator {
    /// Size of the locator header
    pub const HEADER_SIZE: usize = 20;

    /// Parse the parent locator key-value table
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(Error::malformed("VHDX parent locator too small"));
        }

        let locator_type = Guid::from_le_bytes(bytes[0..16].try_into().unwrap());
        if locator_type != VHDX_PARENT_LOCATOR_TYPE {
            return Err(Error::unsupported(format!(
                "parent locator type {}",
                locator_type
            )));
        }

        let key_value_count = u16::from_le_bytes(bytes[18..20].try_into().unwrap());
        let table_end = Self::HEADER_SIZE + usize::from(key_value_count) * 12;
        if bytes.len() < table_end {
            return Err(Error::malformed("VHDX parent locator table truncated"));
        }

        let mut entries = HashMap::with_capacity(usize::from(key_value_count));
        for index in 0..usize::from(key_value_count) {
            let offset = Self::HEADER_SIZE + index * 12;
            let key_offset =
                u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            let value_offset =
                u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap()) as usize;
            let key_length =
                u16::from_le_bytes(bytes[offset + 8..offset + 10].try_into().unwrap()) as usize;
            let value_length =
                u16::from_le_bytes(bytes[offset + 10..offset + 12].try_into().unwrap()) as usize;

            if key_offset + key_length > bytes.len() || value_offset + value_length > bytes.len() {
                return Err(Error::malformed(
                    "VHDX parent locator entry extends beyond the item",
                ));
            }

            let key = decode_utf16le(&bytes[key_offset..key_offset + key_length])
                .ok_or_else(|| Error::malformed("VHDX parent locator key is not UTF-16"))?;
            let value = decode_utf16le(&bytes[value_offset..value_offset + value_length])
                .ok_or_else(|| Error::malformed("VHDX parent locator value is not UTF-16"))?;
            entries.insert(key, value);
        }

        Ok(Self { entries })
    }

    /// The linkage GUID the parent image must carry
    pub fn parent_linkage(&self) -> Result<Option<Guid>> {
        match self.entries.get("parent_linkage") {
            Some(text) => Guid::parse(text).map(Some),
            None => Ok(None),
        }
    }

    /// The preferred filename hint: relative path first, then the absolute
    /// Windows path, then the volume path
    pub fn path_hint(&self) -> Option<&str> {
        for key in ["relative_path", "absolute_win32_path", "volume_path"] {
            if let Some(value) = self.entries.get(key) {
                return Some(value);
            }
        }
        None
    }
}

/// Decode NUL-terminated UTF-16LE bytes
fn decode_utf16le(data: &[u8]) -> Option<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    if units.is_empty() {
        return None;
    }
    String::from_utf16(&units).ok()
}

/// Encode a string as UTF-16LE bytes, without a terminator
#[cfg(test)]
pub(crate) fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}
