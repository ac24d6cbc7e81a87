//! Format detection and image opening
//!
//! Detection is magic-based: `vhdxfile` at offset 0, or the `conectix` VHD
//! footer cookie at the start or in the last 512 bytes. The file extension is
//! consulted only when no magic matches.

use crate::image::DiskImage;
use crate::{vhd, vhdx};
use std::path::Path;
use tracing::debug;
use vhdkit_core::{ByteSource, ContainerFormat, Error, ImageOptions, Result};
use vhdkit_pipeline::{FileSource, MmapSource};

const VHD_MAGIC: &[u8; 8] = b"conectix";
const VHDX_MAGIC: &[u8; 8] = b"vhdxfile";

/// Detect the container format of a byte source from its magic bytes
///
/// Returns `None` when no signature matches.
pub fn detect_format(source: &mut dyn ByteSource) -> Result<Option<ContainerFormat>> {
    let mut magic = [0u8; 8];
    let size = source.size();

    if size >= 8 {
        source.read_exact_at(0, &mut magic)?;
        if &magic == VHDX_MAGIC {
            return Ok(Some(ContainerFormat::Vhdx));
        }
        if &magic == VHD_MAGIC {
            // Sparse VHDs start with a copy of the footer
            return Ok(Some(ContainerFormat::Vhd));
        }
    }

    if size >= 512 {
        source.read_exact_at(size - 512, &mut magic)?;
        if &magic == VHD_MAGIC {
            return Ok(Some(ContainerFormat::Vhd));
        }
    }

    Ok(None)
}

/// Open an image from a byte source with magic-based detection
pub fn open_source(mut source: Box<dyn ByteSource>) -> Result<DiskImage> {
    match detect_format(source.as_mut())? {
        Some(ContainerFormat::Vhd) => vhd::open(source),
        Some(ContainerFormat::Vhdx) => vhdx::open(source),
        None => Err(Error::signature_mismatch(
            "no VHD or VHDX signature found",
        )),
    }
}

/// Open an image file, detecting the container format
///
/// Falls back to the file extension (`.vhd`, `.vhdx`) when no magic bytes
/// match, so truncated images still produce a format-specific error.
pub fn open_image(path: &Path, options: &ImageOptions) -> Result<DiskImage> {
    let mut source: Box<dyn ByteSource> = if options.use_mmap {
        Box::new(MmapSource::open(path)?)
    } else {
        Box::new(FileSource::open(path)?)
    };

    let format = match detect_format(source.as_mut())? {
        Some(format) => format,
        None => match extension_format(path) {
            Some(format) => format,
            None => {
                return Err(Error::signature_mismatch(format!(
                    "'{}' is not a recognized virtual disk image",
                    path.display()
                )))
            }
        },
    };

    debug!(path = %path.display(), %format, "opening image");
    match format {
        ContainerFormat::Vhd => vhd::open(source),
        ContainerFormat::Vhdx => vhdx::open(source),
    }
}

fn extension_format(path: &Path) -> Option<ContainerFormat> {
    match path
        .extension()
        .and_then(|extension| extension.to_str())?
        .to_lowercase()
        .as_str()
    {
        "vhd" => Some(ContainerFormat::Vhd),
        "vhdx" => Some(ContainerFormat::Vhdx),
        _ => None,
    }
}
