//! Synthetic image builders shared by the module tests
//!
//! Each builder produces a complete, checksum-valid image in memory so the
//! open paths can be exercised byte for byte without fixture files.

use crate::vhd::types::{DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFooter};
use crate::vhdx::types::{
    self as vhdx_types, VhdxHeader, VhdxRegionTable, VhdxRegionTableEntry,
};
use std::collections::BTreeMap;
use vhdkit_core::{DiskType, Guid};

/// Build a fixed VHD: the raw body followed by a footer
pub fn fixed_vhd(data: &[u8], identifier: [u8; 16]) -> Vec<u8> {
    let footer = vhd_footer(
        DiskType::Fixed,
        data.len() as u64,
        u64::MAX,
        identifier,
        0,
    );
    let mut bytes = data.to_vec();
    let mut footer_bytes = [0u8; VhdFooter::SIZE];
    footer.serialize(&mut footer_bytes);
    bytes.extend_from_slice(&footer_bytes);
    bytes
}

fn vhd_footer(
    disk_type: DiskType,
    current_size: u64,
    data_offset: u64,
    identifier: [u8; 16],
    saved_state: u8,
) -> VhdFooter {
    VhdFooter {
        features: 0x0000_0002,
        format_version: (1, 0),
        data_offset,
        timestamp: 0,
        creator_app: *b"vhdk",
        creator_version: 0x0001_0000,
        creator_os: 0x5769_326B,
        original_size: current_size,
        current_size,
        geometry: DiskGeometry {
            cylinders: 1024,
            heads: 16,
            sectors: 63,
        },
        disk_type,
        checksum: 0,
        identifier: Guid::from_bytes(identifier),
        saved_state,
    }
}

/// Builder for dynamic and differencing VHD images
///
/// Layout: footer copy, dynamic header, BAT, parent locator data, allocated
/// blocks (bitmap + payload), footer.
pub struct SparseVhdBuilder {
    virtual_size: u64,
    block_size: u32,
    identifier: [u8; 16],
    parent: Option<([u8; 16], String)>,
    saved_state: u8,
    blocks: BTreeMap<u32, Vec<u8>>,
    bitmaps: BTreeMap<u32, Vec<u8>>,
    locators: Vec<([u8; 4], String)>,
}

impl SparseVhdBuilder {
    pub fn new(virtual_size: u64, block_size: u32) -> Self {
        Self {
            virtual_size,
            block_size,
            identifier: [1u8; 16],
            parent: None,
            saved_state: 0,
            blocks: BTreeMap::new(),
            bitmaps: BTreeMap::new(),
            locators: Vec::new(),
        }
    }

    pub fn identifier(&mut self, identifier: [u8; 16]) -> &mut Self {
        self.identifier = identifier;
        self
    }

    /// Turn the image into a differencing image with the given parent link
    pub fn differencing(&mut self, parent_identifier: [u8; 16], parent_name: &str) -> &mut Self {
        self.parent = Some((parent_identifier, parent_name.to_string()));
        self
    }

    pub fn saved_state(&mut self, saved_state: u8) -> &mut Self {
        self.saved_state = saved_state;
        self
    }

    /// Write bytes at a logical offset, allocating the touched blocks
    pub fn write(&mut self, offset: u64, data: &[u8]) -> &mut Self {
        let block_size = u64::from(self.block_size);
        let block_bytes = self.block_size as usize;
        let mut offset = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = (offset / block_size) as u32;
            let in_block = (offset % block_size) as usize;
            let count = remaining.len().min(block_bytes - in_block);

            let payload = self
                .blocks
                .entry(block)
                .or_insert_with(|| vec![0u8; block_bytes]);
            payload[in_block..in_block + count].copy_from_slice(&remaining[..count]);

            offset += count as u64;
            remaining = &remaining[count..];
        }
        self
    }

    /// Override the sector bitmap of an allocated block (raw MSB-first bits)
    pub fn bitmap(&mut self, block: u32, bitmap: Vec<u8>) -> &mut Self {
        self.bitmaps.insert(block, bitmap);
        self
    }

    /// Append a parent locator entry with UTF-16BE data
    pub fn locator(&mut self, platform_code: [u8; 4], path: &str) -> &mut Self {
        self.locators.push((platform_code, path.to_string()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let entry_count = self.virtual_size.div_ceil(u64::from(self.block_size)) as u32;
        let sectors_per_block = self.block_size / 512;
        let bitmap_area = u64::from((sectors_per_block.div_ceil(8)).div_ceil(512) * 512);

        let bat_offset = (VhdFooter::SIZE + VhdDynamicHeader::SIZE) as u64;
        let bat_area = (u64::from(entry_count) * 4).div_ceil(512) * 512;

        // Place parent locator data after the BAT
        let mut cursor = bat_offset + bat_area;
        let mut locator_entries = [ParentLocatorEntry::EMPTY; 8];
        let mut locator_blobs: Vec<(u64, Vec<u8>)> = Vec::new();
        for (index, (code, path)) in self.locators.iter().enumerate() {
            let data: Vec<u8> = path.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect();
            let space = (data.len() as u64).div_ceil(512) * 512;
            locator_entries[index] = ParentLocatorEntry {
                platform_code: *code,
                data_space: (space / 512) as u32,
                data_length: data.len() as u32,
                data_offset: cursor,
            };
            locator_blobs.push((cursor, data));
            cursor += space;
        }

        // Place allocated blocks
        let mut table = vec![0xFFFF_FFFFu32; entry_count as usize];
        let mut block_offsets: Vec<(u64, u32)> = Vec::new();
        for &block in self.blocks.keys() {
            table[block as usize] = (cursor / 512) as u32;
            block_offsets.push((cursor, block));
            cursor += bitmap_area + u64::from(self.block_size);
        }

        let footer_offset = cursor;
        let mut bytes = vec![0u8; (footer_offset + VhdFooter::SIZE as u64) as usize];

        let disk_type = if self.parent.is_some() {
            DiskType::Differential
        } else {
            DiskType::Dynamic
        };
        let footer = vhd_footer(
            disk_type,
            self.virtual_size,
            VhdFooter::SIZE as u64,
            self.identifier,
            self.saved_state,
        );
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);
        bytes[..VhdFooter::SIZE].copy_from_slice(&footer_bytes);
        bytes[footer_offset as usize..].copy_from_slice(&footer_bytes);

        let (parent_identifier, parent_name) = match &self.parent {
            Some((identifier, name)) => (Guid::from_bytes(*identifier), name.as_str()),
            None => (Guid::NIL, ""),
        };
        let mut parent_unicode_name = [0u16; 256];
        for (index, unit) in parent_name.encode_utf16().enumerate() {
            parent_unicode_name[index] = unit;
        }
        let header = VhdDynamicHeader {
            next_offset: u64::MAX,
            table_offset: bat_offset,
            header_version: (1, 0),
            max_table_entries: entry_count,
            block_size: self.block_size,
            checksum: 0,
            parent_identifier,
            parent_timestamp: 0,
            parent_unicode_name,
            parent_locators: locator_entries,
        };
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);
        bytes[VhdFooter::SIZE..VhdFooter::SIZE + VhdDynamicHeader::SIZE]
            .copy_from_slice(&header_bytes);

        for (index, entry) in table.iter().enumerate() {
            let offset = bat_offset as usize + index * 4;
            bytes[offset..offset + 4].copy_from_slice(&entry.to_be_bytes());
        }

        for (offset, data) in &locator_blobs {
            bytes[*offset as usize..*offset as usize + data.len()].copy_from_slice(data);
        }

        for (offset, block) in &block_offsets {
            let offset = *offset as usize;
            let bitmap = self
                .bitmaps
                .get(block)
                .cloned()
                .unwrap_or_else(|| vec![0xFFu8; sectors_per_block.div_ceil(8) as usize]);
            bytes[offset..offset + bitmap.len()].copy_from_slice(&bitmap);

            let payload_offset = offset + bitmap_area as usize;
            let payload = &self.blocks[block];
            bytes[payload_offset..payload_offset + payload.len()].copy_from_slice(payload);
        }

        bytes
    }
}

/// Fixed layout of images produced by [`VhdxBuilder`]
pub const VHDX_METADATA_OFFSET: u64 = 0x50000;
pub const VHDX_METADATA_LENGTH: u32 = 0x20000;
pub const VHDX_BAT_OFFSET: u64 = 0x70000;

/// Offset of the items inside the metadata region
const METADATA_ITEM_BASE: u32 = 0x10000;

/// Content of one VHDX payload block
pub enum VhdxBlockSpec {
    /// Fully present block
    Data(Vec<u8>),
    /// Explicit zero block
    Zero,
    /// Partially present block: payload plus an LSB-first sector bitmap
    Partial { data: Vec<u8>, bitmap: Vec<u8> },
}

/// Builder for VHDX images
///
/// Layout: file type identifier, header pair, region table pair, metadata
/// region at [`VHDX_METADATA_OFFSET`] (table at the region start, items at
/// +64 KiB), BAT at [`VHDX_BAT_OFFSET`], then MiB-aligned payload and sector
/// bitmap blocks. Metadata entries are written in a fixed order: file
/// parameters, virtual disk size, virtual disk id, logical sector size,
/// physical sector size, parent locator.
pub struct VhdxBuilder {
    media_size: u64,
    block_size: u32,
    sector_size: u32,
    leave_blocks_allocated: bool,
    parent: Option<([u8; 16], String)>,
    data_write_guids: ([u8; 16], [u8; 16]),
    sequence_numbers: (u64, u64),
    blocks: BTreeMap<u64, VhdxBlockSpec>,
}

impl VhdxBuilder {
    pub fn new(media_size: u64, block_size: u32) -> Self {
        Self {
            media_size,
            block_size,
            sector_size: 512,
            leave_blocks_allocated: false,
            parent: None,
            data_write_guids: ([2u8; 16], [2u8; 16]),
            sequence_numbers: (1, 2),
            blocks: BTreeMap::new(),
        }
    }

    pub fn sector_size(&mut self, sector_size: u32) -> &mut Self {
        self.sector_size = sector_size;
        self
    }

    /// Mark the image as fixed (leave_blocks_allocated)
    pub fn fixed(&mut self) -> &mut Self {
        self.leave_blocks_allocated = true;
        self
    }

    /// Turn the image into a differential image with the given parent link
    pub fn differential(&mut self, parent_linkage: [u8; 16], parent_path: &str) -> &mut Self {
        self.parent = Some((parent_linkage, parent_path.to_string()));
        self
    }

    /// Data-write GUIDs of the two header slots (canonical bytes)
    pub fn header_guids(&mut self, first: [u8; 16], second: [u8; 16]) -> &mut Self {
        self.data_write_guids = (first, second);
        self
    }

    /// Sequence numbers of the two header slots
    pub fn sequences(&mut self, first: u64, second: u64) -> &mut Self {
        self.sequence_numbers = (first, second);
        self
    }

    /// Write bytes at a logical offset, allocating the touched blocks as
    /// fully present
    pub fn write(&mut self, offset: u64, data: &[u8]) -> &mut Self {
        let block_size = u64::from(self.block_size);
        let block_bytes = self.block_size as usize;
        let mut offset = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let block = offset / block_size;
            let in_block = (offset % block_size) as usize;
            let count = remaining.len().min(block_bytes - in_block);

            let spec = self
                .blocks
                .entry(block)
                .or_insert_with(|| VhdxBlockSpec::Data(vec![0u8; block_bytes]));
            match spec {
                VhdxBlockSpec::Data(payload) => {
                    payload[in_block..in_block + count].copy_from_slice(&remaining[..count]);
                }
                _ => panic!("write into a non-data block"),
            }

            offset += count as u64;
            remaining = &remaining[count..];
        }
        self
    }

    /// Mark a block as an explicit zero block
    pub fn zero_block(&mut self, block: u64) -> &mut Self {
        self.blocks.insert(block, VhdxBlockSpec::Zero);
        self
    }

    /// Mark a block as partially present with the given payload and
    /// LSB-first sector bitmap bits
    pub fn partial_block(&mut self, block: u64, data: Vec<u8>, bitmap: Vec<u8>) -> &mut Self {
        assert_eq!(data.len(), self.block_size as usize);
        self.blocks.insert(block, VhdxBlockSpec::Partial { data, bitmap });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let block_size = u64::from(self.block_size);
        let chunk_ratio = ((1u64 << 23) * u64::from(self.sector_size)) / block_size;
        let payload_count = self.media_size.div_ceil(block_size);
        let chunk_count = payload_count.div_ceil(chunk_ratio);
        let total_entries = chunk_count * (chunk_ratio + 1);
        let bitmap_slice_size = (1u64 << 20) / chunk_ratio;

        let bat_region_length = ((total_entries * 8).div_ceil(0x10000) * 0x10000) as u32;
        let payload_base =
            (VHDX_BAT_OFFSET + u64::from(bat_region_length)).div_ceil(1 << 20) * (1 << 20);

        // Assign MiB-aligned slots: payload blocks first, then one sector
        // bitmap block per chunk that needs one
        let mut cursor = payload_base;
        let mut payload_offsets: BTreeMap<u64, u64> = BTreeMap::new();
        for (&block, spec) in &self.blocks {
            if matches!(spec, VhdxBlockSpec::Data(_) | VhdxBlockSpec::Partial { .. }) {
                payload_offsets.insert(block, cursor);
                cursor += block_size;
            }
        }
        let mut bitmap_block_offsets: BTreeMap<u64, u64> = BTreeMap::new();
        for (&block, spec) in &self.blocks {
            if matches!(spec, VhdxBlockSpec::Partial { .. }) {
                let chunk = block / chunk_ratio;
                bitmap_block_offsets.entry(chunk).or_insert_with(|| {
                    let offset = cursor;
                    cursor += 1 << 20;
                    offset
                });
            }
        }

        let mut bytes = vec![0u8; cursor.max(payload_base) as usize];

        // File type identifier
        bytes[0..8].copy_from_slice(b"vhdxfile");
        let creator: Vec<u8> = "vhdkit"
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        bytes[8..8 + creator.len()].copy_from_slice(&creator);

        // Header pair
        let mut header_bytes = [0u8; vhdx_types::HEADER_SIZE];
        let header = |sequence: u64, guid: [u8; 16]| VhdxHeader {
            checksum: 0,
            sequence_number: sequence,
            file_write_guid: Guid::from_bytes(guid),
            data_write_guid: Guid::from_bytes(guid),
            log_guid: Guid::NIL,
            log_version: 0,
            version: 1,
            log_length: 0,
            log_offset: 0,
        };
        header(self.sequence_numbers.0, self.data_write_guids.0).serialize(&mut header_bytes);
        bytes[vhdx_types::HEADER_1_OFFSET as usize..][..vhdx_types::HEADER_SIZE]
            .copy_from_slice(&header_bytes);
        header(self.sequence_numbers.1, self.data_write_guids.1).serialize(&mut header_bytes);
        bytes[vhdx_types::HEADER_2_OFFSET as usize..][..vhdx_types::HEADER_SIZE]
            .copy_from_slice(&header_bytes);

        // Region table pair
        let region_table = VhdxRegionTable {
            entries: vec![
                VhdxRegionTableEntry {
                    guid: vhdx_types::BAT_REGION_GUID,
                    file_offset: VHDX_BAT_OFFSET,
                    length: bat_region_length,
                    required: true,
                },
                VhdxRegionTableEntry {
                    guid: vhdx_types::METADATA_REGION_GUID,
                    file_offset: VHDX_METADATA_OFFSET,
                    length: VHDX_METADATA_LENGTH,
                    required: true,
                },
            ],
        };
        let mut table_bytes = vec![0u8; vhdx_types::REGION_TABLE_SIZE];
        region_table.serialize(&mut table_bytes);
        bytes[vhdx_types::REGION_TABLE_1_OFFSET as usize..][..vhdx_types::REGION_TABLE_SIZE]
            .copy_from_slice(&table_bytes);
        bytes[vhdx_types::REGION_TABLE_2_OFFSET as usize..][..vhdx_types::REGION_TABLE_SIZE]
            .copy_from_slice(&table_bytes);

        // Metadata region
        self.write_metadata(&mut bytes);

        // Block allocation table
        for (&block, spec) in &self.blocks {
            let table_index =
                (block / chunk_ratio) * (chunk_ratio + 1) + (block % chunk_ratio);
            let entry = match spec {
                VhdxBlockSpec::Data(_) => payload_offsets[&block] | 6,
                VhdxBlockSpec::Zero => 2,
                VhdxBlockSpec::Partial { .. } => payload_offsets[&block] | 7,
            };
            let offset = (VHDX_BAT_OFFSET + table_index * 8) as usize;
            bytes[offset..offset + 8].copy_from_slice(&entry.to_le_bytes());
        }
        for (&chunk, &bitmap_offset) in &bitmap_block_offsets {
            let table_index = chunk * (chunk_ratio + 1) + chunk_ratio;
            let entry = bitmap_offset | 6;
            let offset = (VHDX_BAT_OFFSET + table_index * 8) as usize;
            bytes[offset..offset + 8].copy_from_slice(&entry.to_le_bytes());
        }

        // Payload and sector bitmap blocks
        for (&block, spec) in &self.blocks {
            match spec {
                VhdxBlockSpec::Data(data) | VhdxBlockSpec::Partial { data, .. } => {
                    let offset = payload_offsets[&block] as usize;
                    bytes[offset..offset + data.len()].copy_from_slice(data);
                }
                VhdxBlockSpec::Zero => {}
            }
            if let VhdxBlockSpec::Partial { bitmap, .. } = spec {
                let chunk = block / chunk_ratio;
                let slice_offset = (bitmap_block_offsets[&chunk]
                    + (block % chunk_ratio) * bitmap_slice_size)
                    as usize;
                bytes[slice_offset..slice_offset + bitmap.len()].copy_from_slice(bitmap);
            }
        }

        bytes
    }

    fn write_metadata(&self, bytes: &mut [u8]) {
        let table_base = VHDX_METADATA_OFFSET as usize;
        let item_base = table_base + METADATA_ITEM_BASE as usize;

        // Item data, laid out back to back from the item base
        let mut item_cursor = 0u32;
        let mut entries: Vec<(Guid, u32, u32)> = Vec::new();
        let mut push_item = |item_id: Guid, data: &[u8], bytes: &mut [u8]| {
            let offset = METADATA_ITEM_BASE + item_cursor;
            bytes[item_base + item_cursor as usize..][..data.len()].copy_from_slice(data);
            entries.push((item_id, offset, data.len() as u32));
            item_cursor += data.len() as u32;
        };

        let mut file_parameters = [0u8; 8];
        file_parameters[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        let mut flags = 0u32;
        if self.leave_blocks_allocated {
            flags |= 0x1;
        }
        if self.parent.is_some() {
            flags |= 0x2;
        }
        file_parameters[4..8].copy_from_slice(&flags.to_le_bytes());
        push_item(vhdx_types::FILE_PARAMETERS_GUID, &file_parameters, bytes);

        push_item(
            vhdx_types::VIRTUAL_DISK_SIZE_GUID,
            &self.media_size.to_le_bytes(),
            bytes,
        );
        push_item(
            vhdx_types::VIRTUAL_DISK_ID_GUID,
            &Guid::from_bytes([0x11u8; 16]).to_le_bytes(),
            bytes,
        );
        push_item(
            vhdx_types::LOGICAL_SECTOR_SIZE_GUID,
            &self.sector_size.to_le_bytes(),
            bytes,
        );
        push_item(
            vhdx_types::PHYSICAL_SECTOR_SIZE_GUID,
            &4096u32.to_le_bytes(),
            bytes,
        );

        if let Some((linkage, path)) = &self.parent {
            let locator = parent_locator_item(Guid::from_bytes(*linkage), path);
            push_item(vhdx_types::PARENT_LOCATOR_GUID, &locator, bytes);
        }

        // Table header and entries
        bytes[table_base..table_base + 8].copy_from_slice(b"metadata");
        bytes[table_base + 10..table_base + 12]
            .copy_from_slice(&(entries.len() as u16).to_le_bytes());
        for (index, (item_id, offset, length)) in entries.iter().enumerate() {
            let entry_offset = table_base + 32 + index * 32;
            bytes[entry_offset..entry_offset + 16].copy_from_slice(&item_id.to_le_bytes());
            bytes[entry_offset + 16..entry_offset + 20].copy_from_slice(&offset.to_le_bytes());
            bytes[entry_offset + 20..entry_offset + 24].copy_from_slice(&length.to_le_bytes());
            // IsRequired
            bytes[entry_offset + 24..entry_offset + 28].copy_from_slice(&0x4u32.to_le_bytes());
        }
    }
}

/// Assemble a VHDX parent locator item with linkage and relative path keys
fn parent_locator_item(linkage: Guid, path: &str) -> Vec<u8> {
    let encode = |text: &str| -> Vec<u8> {
        text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
    };
    let pairs = [
        (encode("parent_linkage"), encode(&format!("{{{}}}", linkage))),
        (encode("relative_path"), encode(path)),
    ];

    let data_start = 20 + pairs.len() * 12;
    let total: usize = data_start
        + pairs
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum::<usize>();
    let mut bytes = vec![0u8; total];
    bytes[0..16].copy_from_slice(&vhdx_types::VHDX_PARENT_LOCATOR_TYPE.to_le_bytes());
    bytes[18..20].copy_from_slice(&(pairs.len() as u16).to_le_bytes());

    let mut cursor = data_start;
    for (index, (key, value)) in pairs.iter().enumerate() {
        let entry_offset = 20 + index * 12;
        bytes[entry_offset..entry_offset + 4].copy_from_slice(&(cursor as u32).to_le_bytes());
        bytes[cursor..cursor + key.len()].copy_from_slice(key);
        cursor += key.len();
        bytes[entry_offset + 4..entry_offset + 8].copy_from_slice(&(cursor as u32).to_le_bytes());
        bytes[cursor..cursor + value.len()].copy_from_slice(value);
        cursor += value.len();
        bytes[entry_offset + 8..entry_offset + 10]
            .copy_from_slice(&(key.len() as u16).to_le_bytes());
        bytes[entry_offset + 10..entry_offset + 12]
            .copy_from_slice(&(value.len() as u16).to_le_bytes());
    }

    bytes
}
