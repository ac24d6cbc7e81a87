//! VHDX (version 2) container support
//!
//! ## Format overview
//!
//! The container anchors at fixed offsets: a file type identifier at 0, two
//! header slots at 64 KiB and 128 KiB (the valid slot with the greater
//! sequence number is authoritative), and two region table copies at 192 KiB
//! and 256 KiB. The region table locates the block allocation table and the
//! metadata region; metadata items carry the block size, virtual disk size,
//! identifiers, sector sizes and the parent locator.

pub mod types;

use crate::bat::BlockAllocationTable;
use crate::chain::ImageChain;
use crate::descriptor::ImageDescriptor;
use crate::image::DiskImage;
use tracing::{debug, warn};
use types::{
    VhdxFileParameters, VhdxFileTypeIdentifier, VhdxHeader, VhdxMetadataEntry, VhdxMetadataTable,
    VhdxParentLocator, VhdxRegionTable, VhdxRegionTableEntry,
};
use vhdkit_core::{ByteSource, ContainerFormat, DiskType, Error, Guid, Result};

/// Smallest file that can hold the anchor structures
const MIN_FILE_SIZE: u64 = types::REGION_TABLE_2_OFFSET + types::REGION_TABLE_SIZE as u64;

/// Open a VHDX image from a byte source
///
/// # Errors
///
/// Returns an error if the anchors are damaged (both header slots with bad
/// checksums fail with [`Error::ChecksumMismatch`]), a required region or
/// metadata item is missing or unknown, or a structural invariant does not
/// hold.
pub fn open(mut source: Box<dyn ByteSource>) -> Result<DiskImage> {
    let file_size = source.size();
    if file_size < MIN_FILE_SIZE {
        return Err(Error::malformed("file too small to be a VHDX"));
    }

    let mut fti_bytes = [0u8; VhdxFileTypeIdentifier::SIZE];
    source.read_exact_at(0, &mut fti_bytes)?;
    let fti = VhdxFileTypeIdentifier::parse(&fti_bytes)?;
    debug!(creator = %fti.creator, "parsed VHDX file type identifier");

    let header = read_current_header(source.as_mut())?;
    debug!(
        sequence_number = header.sequence_number,
        identifier = %header.data_write_guid,
        "selected VHDX header"
    );

    let region_table = read_region_table(source.as_mut())?;
    let metadata_region = *region_table
        .region(types::METADATA_REGION_GUID)
        .ok_or_else(|| Error::malformed("missing metadata region"))?;
    let bat_region = *region_table
        .region(types::BAT_REGION_GUID)
        .ok_or_else(|| Error::malformed("missing block allocation table region"))?;

    for (name, region) in [("metadata", &metadata_region), ("BAT", &bat_region)] {
        if region.file_offset + u64::from(region.length) > file_size {
            return Err(Error::malformed(format!(
                "{} region at offset {} extends beyond file size {}",
                name, region.file_offset, file_size
            )));
        }
    }

    let metadata = read_metadata(source.as_mut(), &metadata_region)?;

    let block_size = metadata.file_parameters.block_size;
    if !block_size.is_power_of_two()
        || !(1 << 20..=256 << 20).contains(&block_size)
    {
        return Err(Error::malformed(format!(
            "block size {} is not a power of two between 1 MiB and 256 MiB",
            block_size
        )));
    }

    let disk_type = if metadata.file_parameters.has_parent {
        DiskType::Differential
    } else if metadata.file_parameters.leave_blocks_allocated {
        DiskType::Fixed
    } else {
        DiskType::Dynamic
    };

    let (parent_identifier, parent_filename) = match (&metadata.parent_locator, disk_type) {
        (Some(locator), DiskType::Differential) => {
            let linkage = locator.parent_linkage()?.ok_or_else(|| {
                Error::parent_mismatch("differential VHDX parent locator has no linkage GUID")
            })?;
            (Some(linkage), locator.path_hint().map(str::to_string))
        }
        (None, DiskType::Differential) => {
            return Err(Error::parent_mismatch(
                "differential VHDX carries no parent locator",
            ));
        }
        _ => (None, None),
    };

    let bat = BlockAllocationTable::load_vhdx(
        source.as_mut(),
        bat_region.file_offset,
        u64::from(bat_region.length),
        block_size,
        metadata.bytes_per_sector,
        metadata.media_size,
        disk_type == DiskType::Differential,
    )?;

    let descriptor = ImageDescriptor {
        format: ContainerFormat::Vhdx,
        format_version: (header.version, 0),
        disk_type,
        media_size: metadata.media_size,
        bytes_per_sector: metadata.bytes_per_sector,
        identifier: header.data_write_guid,
        parent_identifier,
        parent_filename,
        saved_state: false,
        geometry: None,
        bat: Some(bat),
    };

    descriptor.validate()?;
    Ok(DiskImage::new(ImageChain::new(descriptor, source)))
}

/// Read both header slots and pick the authoritative one
///
/// The header with the greater sequence number among the slots with a valid
/// checksum wins; if both slots are invalid the load fails.
fn read_current_header(source: &mut dyn ByteSource) -> Result<VhdxHeader> {
    let mut read_slot = |offset: u64| -> Result<VhdxHeader> {
        let mut bytes = vec![0u8; types::HEADER_SIZE];
        source.read_exact_at(offset, &mut bytes)?;
        VhdxHeader::parse(&bytes)
    };

    let first = read_slot(types::HEADER_1_OFFSET);
    let second = read_slot(types::HEADER_2_OFFSET);

    match (first, second) {
        (Ok(first), Ok(second)) => {
            if second.sequence_number > first.sequence_number {
                Ok(second)
            } else {
                Ok(first)
            }
        }
        (Ok(header), Err(error)) | (Err(error), Ok(header)) => {
            warn!(%error, "one VHDX header slot is damaged");
            Ok(header)
        }
        (Err(first_error), Err(second_error)) => {
            if matches!(first_error, Error::ChecksumMismatch(_)) {
                Err(first_error)
            } else {
                Err(second_error)
            }
        }
    }
}

/// Read the region table, falling back to the second copy
fn read_region_table(source: &mut dyn ByteSource) -> Result<VhdxRegionTable> {
    let mut read_copy = |offset: u64| -> Result<VhdxRegionTable> {
        let mut bytes = vec![0u8; types::REGION_TABLE_SIZE];
        source.read_exact_at(offset, &mut bytes)?;
        VhdxRegionTable::parse(&bytes)
    };

    match read_copy(types::REGION_TABLE_1_OFFSET) {
        Ok(table) => Ok(table),
        Err(primary_error) => match read_copy(types::REGION_TABLE_2_OFFSET) {
            Ok(table) => {
                warn!("primary VHDX region table is damaged, using the second copy");
                Ok(table)
            }
            Err(_) => Err(primary_error),
        },
    }
}

/// The system metadata items an image must carry
struct MetadataValues {
    file_parameters: VhdxFileParameters,
    media_size: u64,
    bytes_per_sector: u32,
    parent_locator: Option<VhdxParentLocator>,
}

/// Read the metadata table and consume the system items
fn read_metadata(
    source: &mut dyn ByteSource,
    region: &VhdxRegionTableEntry,
) -> Result<MetadataValues> {
    let table_size = (region.length as usize).min(types::REGION_TABLE_SIZE);
    let mut table_bytes = vec![0u8; table_size];
    source.read_exact_at(region.file_offset, &mut table_bytes)?;
    let table = VhdxMetadataTable::parse(&table_bytes, region.length)?;

    let mut file_parameters: Option<VhdxFileParameters> = None;
    let mut media_size: Option<u64> = None;
    let mut bytes_per_sector: Option<u32> = None;
    let mut virtual_disk_id: Option<Guid> = None;
    let mut parent_locator: Option<VhdxParentLocator> = None;

    fn read_item(
        source: &mut dyn ByteSource,
        region_offset: u64,
        entry: &VhdxMetadataEntry,
        expected_length: Option<usize>,
    ) -> Result<Vec<u8>> {
        if let Some(expected) = expected_length {
            if entry.length as usize != expected {
                return Err(Error::malformed(format!(
                    "metadata item {} has length {}, expected {}",
                    entry.item_id, entry.length, expected
                )));
            }
        }
        let mut data = vec![0u8; entry.length as usize];
        source.read_exact_at(region_offset + u64::from(entry.offset), &mut data)?;
        Ok(data)
    }

    fn check_duplicate<T>(slot: &Option<T>, entry: &VhdxMetadataEntry) -> Result<()> {
        if slot.is_some() {
            return Err(Error::malformed(format!(
                "duplicate metadata item {}",
                entry.item_id
            )));
        }
        Ok(())
    }

    for entry in &table.entries {
        let item_id = entry.item_id;
        if item_id == types::FILE_PARAMETERS_GUID {
            check_duplicate(&file_parameters, entry)?;
            let data = read_item(source, region.file_offset, entry, Some(8))?;
            file_parameters = Some(VhdxFileParameters::parse(&data)?);
        } else if item_id == types::VIRTUAL_DISK_SIZE_GUID {
            check_duplicate(&media_size, entry)?;
            let data = read_item(source, region.file_offset, entry, Some(8))?;
            media_size = Some(u64::from_le_bytes(data[0..8].try_into().unwrap()));
        } else if item_id == types::VIRTUAL_DISK_ID_GUID {
            check_duplicate(&virtual_disk_id, entry)?;
            let data = read_item(source, region.file_offset, entry, Some(16))?;
            let identifier = Guid::from_le_bytes(data[0..16].try_into().unwrap());
            debug!(virtual_disk_id = %identifier, "parsed virtual disk identifier");
            virtual_disk_id = Some(identifier);
        } else if item_id == types::LOGICAL_SECTOR_SIZE_GUID {
            check_duplicate(&bytes_per_sector, entry)?;
            let data = read_item(source, region.file_offset, entry, Some(4))?;
            let sector_size = u32::from_le_bytes(data[0..4].try_into().unwrap());
            if sector_size != 512 && sector_size != 4096 {
                return Err(Error::unsupported(format!(
                    "logical sector size {}",
                    sector_size
                )));
            }
            bytes_per_sector = Some(sector_size);
        } else if item_id == types::PHYSICAL_SECTOR_SIZE_GUID {
            let data = read_item(source, region.file_offset, entry, Some(4))?;
            let sector_size = u32::from_le_bytes(data[0..4].try_into().unwrap());
            if sector_size != 512 && sector_size != 4096 {
                return Err(Error::unsupported(format!(
                    "physical sector size {}",
                    sector_size
                )));
            }
        } else if item_id == types::PARENT_LOCATOR_GUID {
            check_duplicate(&parent_locator, entry)?;
            let data = read_item(source, region.file_offset, entry, None)?;
            parent_locator = Some(VhdxParentLocator::parse(&data)?);
        } else if entry.is_required && !entry.is_user {
            return Err(Error::unsupported(format!(
                "unknown required metadata item {}",
                item_id
            )));
        } else {
            debug!(item_id = %item_id, "ignoring unknown metadata item");
        }
    }

    let file_parameters = file_parameters
        .ok_or_else(|| Error::malformed("missing file parameters metadata item"))?;
    let media_size =
        media_size.ok_or_else(|| Error::malformed("missing virtual disk size metadata item"))?;
    let bytes_per_sector = bytes_per_sector
        .ok_or_else(|| Error::malformed("missing logical sector size metadata item"))?;
    if virtual_disk_id.is_none() {
        return Err(Error::malformed(
            "missing virtual disk identifier metadata item",
        ));
    }

    Ok(MetadataValues {
        file_parameters,
        media_size,
        bytes_per_sector,
        parent_locator,
    })
}
