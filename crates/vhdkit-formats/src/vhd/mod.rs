//! VHD (version 1) container support
//!
//! ## Format overview
//!
//! Every VHD carries a 512-byte footer at the end of the file. Fixed images
//! store the disk contents verbatim from offset 0. Dynamic and differencing
//! images start with a copy of the footer, followed by a dynamic header that
//! locates the block allocation table; each allocated block is preceded by a
//! per-sector bitmap.

pub mod types;

use crate::bat::BlockAllocationTable;
use crate::chain::ImageChain;
use crate::descriptor::ImageDescriptor;
use crate::image::DiskImage;
use tracing::{debug, warn};
use types::{ParentLocatorEntry, VhdDynamicHeader, VhdFooter};
use vhdkit_core::{ByteSource, ContainerFormat, DiskType, Error, Result};

/// Upper bound accepted for parent locator data
const MAX_LOCATOR_DATA: u32 = 64 * 1024;

/// Open a VHD image from a byte source
///
/// # Errors
///
/// Returns an error if the footer or dynamic header is invalid, a checksum
/// disagrees, the disk type is unsupported, or a structural invariant does
/// not hold.
pub fn open(mut source: Box<dyn ByteSource>) -> Result<DiskImage> {
    let file_size = source.size();
    if file_size < VhdFooter::SIZE as u64 {
        return Err(Error::malformed("file too small to be a VHD"));
    }

    let footer = read_footer(source.as_mut(), file_size)?;

    debug!(
        disk_type = %footer.disk_type,
        media_size = footer.current_size,
        "parsed VHD footer"
    );

    let media_size = footer.current_size;

    let descriptor = match footer.disk_type {
        DiskType::Fixed => {
            // Fixed images hold the disk contents verbatim before the footer
            if media_size + VhdFooter::SIZE as u64 > file_size {
                return Err(Error::malformed(format!(
                    "fixed VHD media size {} does not fit in file size {}",
                    media_size, file_size
                )));
            }
            ImageDescriptor {
                format: ContainerFormat::Vhd,
                format_version: footer.format_version,
                disk_type: DiskType::Fixed,
                media_size,
                bytes_per_sector: 512,
                identifier: footer.identifier,
                parent_identifier: None,
                parent_filename: None,
                saved_state: footer.saved_state != 0,
                geometry: Some(footer.geometry),
                bat: None,
            }
        }
        DiskType::Dynamic | DiskType::Differential => {
            let differencing = footer.disk_type == DiskType::Differential;

            if footer.data_offset == u64::MAX
                || footer.data_offset + VhdDynamicHeader::SIZE as u64 > file_size
            {
                return Err(Error::malformed(format!(
                    "sparse VHD has an invalid dynamic header offset {:#x}",
                    footer.data_offset
                )));
            }

            let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
            source.read_exact_at(footer.data_offset, &mut header_bytes)?;
            let header = VhdDynamicHeader::parse(&header_bytes)?;

            if header.block_size < 512 || !header.block_size.is_power_of_two() {
                return Err(Error::malformed(format!(
                    "block size {} is not a power-of-two multiple of 512",
                    header.block_size
                )));
            }

            let block_count = media_size.div_ceil(u64::from(header.block_size));
            if block_count > u64::from(header.max_table_entries) {
                return Err(Error::malformed(format!(
                    "block allocation table holds {} entries, {} required for media size {}",
                    header.max_table_entries, block_count, media_size
                )));
            }

            let bat = BlockAllocationTable::load_vhd(
                source.as_mut(),
                header.table_offset,
                block_count as u32,
                header.block_size,
                differencing,
            )?;

            let (parent_identifier, parent_filename) = if differencing {
                if header.parent_identifier.is_nil() {
                    return Err(Error::parent_mismatch(
                        "differencing VHD carries a nil parent identifier",
                    ));
                }
                let filename = header
                    .parent_name()
                    .or_else(|| locator_filename(source.as_mut(), &header, file_size));
                (Some(header.parent_identifier), filename)
            } else {
                (None, None)
            };

            ImageDescriptor {
                format: ContainerFormat::Vhd,
                format_version: footer.format_version,
                disk_type: footer.disk_type,
                media_size,
                bytes_per_sector: 512,
                identifier: footer.identifier,
                parent_identifier,
                parent_filename,
                saved_state: footer.saved_state != 0,
                geometry: Some(footer.geometry),
                bat: Some(bat),
            }
        }
    };

    descriptor.validate()?;
    Ok(DiskImage::new(ImageChain::new(descriptor, source)))
}

/// Read the footer from the end of the file, falling back to the copy at
/// the start of sparse images when the primary is damaged
fn read_footer(source: &mut dyn ByteSource, file_size: u64) -> Result<VhdFooter> {
    let mut footer_bytes = [0u8; VhdFooter::SIZE];
    source.read_exact_at(file_size - VhdFooter::SIZE as u64, &mut footer_bytes)?;

    match VhdFooter::parse(&footer_bytes) {
        Ok(footer) => Ok(footer),
        Err(primary_error @ (Error::SignatureMismatch(_) | Error::ChecksumMismatch(_))) => {
            source.read_exact_at(0, &mut footer_bytes)?;
            match VhdFooter::parse(&footer_bytes) {
                Ok(footer) => {
                    warn!("VHD footer at end of file is damaged, using the copy at the start");
                    Ok(footer)
                }
                Err(_) => Err(primary_error),
            }
        }
        Err(error) => Err(error),
    }
}

/// Decode the first readable parent locator as UTF-16BE
fn locator_filename(
    source: &mut dyn ByteSource,
    header: &VhdDynamicHeader,
    file_size: u64,
) -> Option<String> {
    for entry in header.parent_locators.iter().filter(|e| e.is_present()) {
        match &entry.platform_code {
            ParentLocatorEntry::PLATFORM_W2KU | ParentLocatorEntry::PLATFORM_W2RU => {
                if entry.data_length > MAX_LOCATOR_DATA
                    || entry.data_offset + u64::from(entry.data_length) > file_size
                {
                    warn!(
                        offset = entry.data_offset,
                        length = entry.data_length,
                        "skipping parent locator with out-of-bounds data"
                    );
                    continue;
                }
                let mut data = vec![0u8; entry.data_length as usize];
                if source.read_exact_at(entry.data_offset, &mut data).is_err() {
                    continue;
                }
                if let Some(name) = decode_utf16be(&data) {
                    return Some(name);
                }
            }
            code => {
                warn!(
                    platform_code = %String::from_utf8_lossy(code),
                    "ignoring parent locator with unhandled platform code"
                );
            }
        }
    }
    None
}

fn decode_utf16be(data: &[u8]) -> Option<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    if units.is_empty() {
        return None;
    }
    String::from_utf16(&units).ok()
}
