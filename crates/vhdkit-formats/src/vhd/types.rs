//! VHD on-disk structures
//!
//! The legacy container stores a 512-byte footer at the end of the file
//! (sparse images carry a copy at the start) and, for sparse images, a
//! 1024-byte dynamic header at the footer's data offset. All multi-byte
//! fields are big-endian.

use crate::checksum;
use vhdkit_core::{DiskType, Error, Guid, Result};

/// VHD disk type values as stored in the footer
const VHD_TYPE_FIXED: u32 = 2;
const VHD_TYPE_DYNAMIC: u32 = 3;
const VHD_TYPE_DIFFERENCING: u32 = 4;

/// Advisory cylinder/head/sector geometry
///
/// Recorded by producers for BIOS-era consumers; never used for size
/// computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    /// Parse disk geometry from 4 bytes
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    /// Convert geometry to bytes
    pub fn to_bytes(&self) -> [u8; 4] {
        let cylinder_bytes = self.cylinders.to_be_bytes();
        [cylinder_bytes[0], cylinder_bytes[1], self.heads, self.sectors]
    }
}

/// VHD footer (512 bytes)
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub features: u32,
    pub format_version: (u16, u16),
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub identifier: Guid,
    pub saved_state: u8,
}

impl VhdFooter {
    /// Footer cookie value
    pub const COOKIE: &'static [u8; 8] = b"conectix";

    /// Size of the footer in bytes
    pub const SIZE: usize = 512;

    /// Byte offset of the checksum field
    const CHECKSUM_OFFSET: usize = 64;

    /// Parse and verify a footer
    ///
    /// # Errors
    ///
    /// - [`Error::SignatureMismatch`] if the cookie is absent
    /// - [`Error::ChecksumMismatch`] if the stored checksum disagrees with
    ///   the one's-complement sum of the other bytes
    /// - [`Error::UnsupportedFormat`] for unknown versions and disk types
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("VHD footer too small"));
        }
        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::signature_mismatch(format!(
                "expected VHD footer cookie 'conectix', got '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let checksum = u32::from_be_bytes(bytes[64..68].try_into().unwrap());
        let computed = checksum::ones_complement_sum(&bytes[..Self::SIZE], Self::CHECKSUM_OFFSET);
        if checksum != computed {
            return Err(Error::checksum_mismatch(format!(
                "VHD footer checksum is {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let version = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let format_version = ((version >> 16) as u16, version as u16);
        if format_version.0 != 1 {
            return Err(Error::unsupported(format!(
                "VHD format version {}.{}",
                format_version.0, format_version.1
            )));
        }

        let disk_type_raw = u32::from_be_bytes(bytes[60..64].try_into().unwrap());
        let disk_type = match disk_type_raw {
            VHD_TYPE_FIXED => DiskType::Fixed,
            VHD_TYPE_DYNAMIC => DiskType::Dynamic,
            VHD_TYPE_DIFFERENCING => DiskType::Differential,
            other => {
                return Err(Error::unsupported(format!("VHD disk type {}", other)));
            }
        };

        Ok(Self {
            features: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            format_version,
            data_offset: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            timestamp: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
            creator_app: bytes[28..32].try_into().unwrap(),
            creator_version: u32::from_be_bytes(bytes[32..36].try_into().unwrap()),
            creator_os: u32::from_be_bytes(bytes[36..40].try_into().unwrap()),
            original_size: u64::from_be_bytes(bytes[40..48].try_into().unwrap()),
            current_size: u64::from_be_bytes(bytes[48..56].try_into().unwrap()),
            geometry: DiskGeometry::parse(&bytes[56..60]),
            disk_type,
            checksum,
            identifier: Guid::from_be_bytes(bytes[68..84].try_into().unwrap()),
            saved_state: bytes[84],
        })
    }

    /// Serialize the footer, computing a fresh checksum
    ///
    /// Reserved bytes are written as zeros. Used by synthetic-image
    /// construction in tests; the library itself never writes images.
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes.fill(0);
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        let version = (u32::from(self.format_version.0) << 16) | u32::from(self.format_version.1);
        bytes[12..16].copy_from_slice(&version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        let disk_type = match self.disk_type {
            DiskType::Fixed => VHD_TYPE_FIXED,
            DiskType::Dynamic => VHD_TYPE_DYNAMIC,
            DiskType::Differential => VHD_TYPE_DIFFERENCING,
        };
        bytes[60..64].copy_from_slice(&disk_type.to_be_bytes());
        bytes[68..84].copy_from_slice(self.identifier.as_bytes());
        bytes[84] = self.saved_state;

        let checksum = checksum::ones_complement_sum(bytes, Self::CHECKSUM_OFFSET);
        bytes[64..68].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// VHD dynamic header (1024 bytes), present in dynamic and differencing images
#[derive(Debug, Clone)]
pub struct VhdDynamicHeader {
    pub next_offset: u64,
    pub table_offset: u64,
    pub header_version: (u16, u16),
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_identifier: Guid,
    pub parent_timestamp: u32,
    pub parent_unicode_name: [u16; 256],
    pub parent_locators: [ParentLocatorEntry; 8],
}

impl VhdDynamicHeader {
    /// Dynamic header cookie value
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";

    /// Size of the dynamic header in bytes
    pub const SIZE: usize = 1024;

    /// Byte offset of the checksum field
    const CHECKSUM_OFFSET: usize = 36;

    /// Parse and verify a dynamic header
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::malformed("VHD dynamic header too small"));
        }
        if &bytes[0..8] != Self::COOKIE {
            return Err(Error::signature_mismatch(format!(
                "expected VHD dynamic header cookie 'cxsparse', got '{}'",
                String::from_utf8_lossy(&bytes[0..8])
            )));
        }

        let checksum = u32::from_be_bytes(bytes[36..40].try_into().unwrap());
        let computed = checksum::ones_complement_sum(&bytes[..Self::SIZE], Self::CHECKSUM_OFFSET);
        if checksum != computed {
            return Err(Error::checksum_mismatch(format!(
                "VHD dynamic header checksum is {:#010x}, computed {:#010x}",
                checksum, computed
            )));
        }

        let version = u32::from_be_bytes(bytes[24..28].try_into().unwrap());
        let header_version = ((version >> 16) as u16, version as u16);
        if header_version.0 != 1 {
            return Err(Error::unsupported(format!(
                "VHD dynamic header version {}.{}",
                header_version.0, header_version.1
            )));
        }

        // Parent name is stored as UTF-16BE code units
        let mut parent_unicode_name = [0u16; 256];
        for (index, unit) in parent_unicode_name.iter_mut().enumerate() {
            let offset = 64 + index * 2;
            *unit = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }

        let mut parent_locators = [ParentLocatorEntry::EMPTY; 8];
        for (index, entry) in parent_locators.iter_mut().enumerate() {
            let offset = 576 + index * ParentLocatorEntry::SIZE;
            *entry = ParentLocatorEntry::parse(&bytes[offset..offset + ParentLocatorEntry::SIZE]);
        }

        Ok(Self {
            next_offset: u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
            table_offset: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
            header_version,
            max_table_entries: u32::from_be_bytes(bytes[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(bytes[32..36].try_into().unwrap()),
            checksum,
            parent_identifier: Guid::from_be_bytes(bytes[40..56].try_into().unwrap()),
            parent_timestamp: u32::from_be_bytes(bytes[56..60].try_into().unwrap()),
            parent_unicode_name,
            parent_locators,
        })
    }

    /// Parent name from the header's UTF-16BE field, if any
    pub fn parent_name(&self) -> Option<String> {
        let end = self
            .parent_unicode_name
            .iter()
            .position(|&unit| unit == 0)
            .unwrap_or(self.parent_unicode_name.len());
        if end == 0 {
            return None;
        }
        String::from_utf16(&self.parent_unicode_name[..end]).ok()
    }

    /// Serialize the header, computing a fresh checksum
    ///
    /// Reserved bytes are written as zeros. Used by synthetic-image
    /// construction in tests.
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes.fill(0);
        bytes[0..8].copy_from_slice(Self::COOKIE);
        bytes[8..16].copy_from_slice(&self.next_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        let version =
            (u32::from(self.header_version.0) << 16) | u32::from(self.header_version.1);
        bytes[24..28].copy_from_slice(&version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[40..56].copy_from_slice(self.parent_identifier.as_bytes());
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        for (index, unit) in self.parent_unicode_name.iter().enumerate() {
            let offset = 64 + index * 2;
            bytes[offset..offset + 2].copy_from_slice(&unit.to_be_bytes());
        }
        for (index, entry) in self.parent_locators.iter().enumerate() {
            let offset = 576 + index * ParentLocatorEntry::SIZE;
            entry.serialize(&mut bytes[offset..offset + ParentLocatorEntry::SIZE]);
        }

        let checksum = checksum::ones_complement_sum(bytes, Self::CHECKSUM_OFFSET);
        bytes[36..40].copy_from_slice(&checksum.to_be_bytes());
    }
}

/// One parent locator entry (24 bytes) of the dynamic header
#[derive(Debug, Clone, Copy)]
pub struct ParentLocatorEntry {
    /// Platform code, e.g. `W2ku` or `W2ru`
    pub platform_code: [u8; 4],
    /// Space reserved for the locator data, in 512-byte sectors
    pub data_space: u32,
    /// Length of the locator data in bytes
    pub data_length: u32,
    /// Absolute file offset of the locator data
    pub data_offset: u64,
}

impl ParentLocatorEntry {
    /// Windows relative path, UTF-16
    pub const PLATFORM_W2RU: &'static [u8; 4] = b"W2ru";
    /// Windows absolute path, UTF-16
    pub const PLATFORM_W2KU: &'static [u8; 4] = b"W2ku";
    /// Mac OS X file URL
    pub const PLATFORM_MACX: &'static [u8; 4] = b"MacX";

    /// Size of a locator entry in bytes
    pub const SIZE: usize = 24;

    /// The all-zero entry
    pub const EMPTY: ParentLocatorEntry = ParentLocatorEntry {
        platform_code: [0u8; 4],
        data_space: 0,
        data_length: 0,
        data_offset: 0,
    };

    /// Parse a locator entry; unused slots come back as [`Self::EMPTY`]
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            platform_code: bytes[0..4].try_into().unwrap(),
            data_space: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            data_length: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            data_offset: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        }
    }

    /// Serialize a locator entry
    pub fn serialize(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.platform_code);
        bytes[4..8].copy_from_slice(&self.data_space.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        bytes[12..16].fill(0);
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
    }

    /// Whether this slot holds a locator at all
    pub fn is_present(&self) -> bool {
        self.platform_code != [0u8; 4] && self.data_length > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_footer(disk_type: DiskType) -> VhdFooter {
        VhdFooter {
            features: 0x0000_0002,
            format_version: (1, 0),
            data_offset: match disk_type {
                DiskType::Fixed => u64::MAX,
                _ => 512,
            },
            timestamp: 0,
            creator_app: *b"vhdk",
            creator_version: 0x0001_0000,
            creator_os: 0x5769_326B, // Wi2k
            original_size: 1 << 20,
            current_size: 1 << 20,
            geometry: DiskGeometry {
                cylinders: 1024,
                heads: 16,
                sectors: 63,
            },
            disk_type,
            checksum: 0,
            identifier: Guid::from_bytes([7u8; 16]),
            saved_state: 0,
        }
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = test_footer(DiskType::Fixed);
        let mut bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut bytes);

        let parsed = VhdFooter::parse(&bytes).unwrap();
        assert_eq!(parsed.disk_type, DiskType::Fixed);
        assert_eq!(parsed.current_size, 1 << 20);
        assert_eq!(parsed.format_version, (1, 0));
        assert_eq!(parsed.identifier, Guid::from_bytes([7u8; 16]));
        assert_eq!(parsed.geometry.cylinders, 1024);
    }

    #[test]
    fn test_footer_rejects_bad_cookie() {
        let footer = test_footer(DiskType::Fixed);
        let mut bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut bytes);
        bytes[0..8].copy_from_slice(b"notvalid");

        assert!(matches!(
            VhdFooter::parse(&bytes),
            Err(Error::SignatureMismatch(_))
        ));
    }

    #[test]
    fn test_footer_rejects_bad_checksum() {
        let footer = test_footer(DiskType::Fixed);
        let mut bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut bytes);
        bytes[64] ^= 0xFF;

        assert!(matches!(
            VhdFooter::parse(&bytes),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_footer_rejects_unknown_disk_type() {
        let footer = test_footer(DiskType::Fixed);
        let mut bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut bytes);
        // Disk type 5 is reserved; fix the checksum up for the new value
        bytes[60..64].copy_from_slice(&5u32.to_be_bytes());
        let checksum = checksum::ones_complement_sum(&bytes, 64);
        bytes[64..68].copy_from_slice(&checksum.to_be_bytes());

        assert!(matches!(
            VhdFooter::parse(&bytes),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    fn test_header(parent_name: &str) -> VhdDynamicHeader {
        let mut parent_unicode_name = [0u16; 256];
        for (index, unit) in parent_name.encode_utf16().enumerate() {
            parent_unicode_name[index] = unit;
        }
        VhdDynamicHeader {
            next_offset: u64::MAX,
            table_offset: 1536,
            header_version: (1, 0),
            max_table_entries: 32,
            block_size: 2 << 20,
            checksum: 0,
            parent_identifier: Guid::from_bytes([3u8; 16]),
            parent_timestamp: 0,
            parent_unicode_name,
            parent_locators: [ParentLocatorEntry::EMPTY; 8],
        }
    }

    #[test]
    fn test_dynamic_header_roundtrip() {
        let header = test_header("base.vhd");
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);

        let parsed = VhdDynamicHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.table_offset, 1536);
        assert_eq!(parsed.max_table_entries, 32);
        assert_eq!(parsed.block_size, 2 << 20);
        assert_eq!(parsed.parent_name().as_deref(), Some("base.vhd"));
    }

    #[test]
    fn test_dynamic_header_rejects_bad_checksum() {
        let header = test_header("");
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);
        bytes[37] ^= 0x10;

        assert!(matches!(
            VhdDynamicHeader::parse(&bytes),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_dynamic_header_empty_parent_name() {
        let header = test_header("");
        let mut bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut bytes);

        let parsed = VhdDynamicHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.parent_name(), None);
    }

    #[test]
    fn test_parent_locator_entry_roundtrip() {
        let entry = ParentLocatorEntry {
            platform_code: *ParentLocatorEntry::PLATFORM_W2KU,
            data_space: 1,
            data_length: 100,
            data_offset: 0x1000,
        };
        let mut bytes = [0u8; ParentLocatorEntry::SIZE];
        entry.serialize(&mut bytes);

        let parsed = ParentLocatorEntry::parse(&bytes);
        assert!(parsed.is_present());
        assert_eq!(parsed.data_length, 100);
        assert_eq!(parsed.data_offset, 0x1000);

        assert!(!ParentLocatorEntry::EMPTY.is_present());
    }
}
