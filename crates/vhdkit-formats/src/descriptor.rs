//! Immutable description of an opened image
//!
//! An [`ImageDescriptor`] is built once by the format loaders and never
//! mutated afterwards. All resolution and read paths work from it, which is
//! what makes concurrent immutable access safe without internal locks.

use crate::bat::BlockAllocationTable;
use crate::vhd::types::DiskGeometry;
use vhdkit_core::{ContainerFormat, DiskType, Error, Guid, Result};

/// Everything the resolver and the accessors need to know about one image
pub struct ImageDescriptor {
    pub(crate) format: ContainerFormat,
    pub(crate) format_version: (u16, u16),
    pub(crate) disk_type: DiskType,
    pub(crate) media_size: u64,
    pub(crate) bytes_per_sector: u32,
    pub(crate) identifier: Guid,
    pub(crate) parent_identifier: Option<Guid>,
    pub(crate) parent_filename: Option<String>,
    pub(crate) saved_state: bool,
    pub(crate) geometry: Option<DiskGeometry>,
    /// `None` only for fixed VHD images, which have no block structure
    pub(crate) bat: Option<BlockAllocationTable>,
}

impl ImageDescriptor {
    /// Container format of the image
    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// Format version as (major, minor)
    pub fn format_version(&self) -> (u16, u16) {
        self.format_version
    }

    /// Disk type of the image
    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    /// Logical disk size in bytes
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    /// Logical sector size in bytes (512, or 4096 for some VHDX images)
    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    /// Allocation block size in bytes; 0 for fixed VHD images
    pub fn block_size(&self) -> u32 {
        self.bat.as_ref().map(|bat| bat.block_size()).unwrap_or(0)
    }

    /// Identifier of this image
    ///
    /// For VHD this is the footer identifier; for VHDX the data-write GUID of
    /// the current header, which is what differencing children link against.
    pub fn identifier(&self) -> Guid {
        self.identifier
    }

    /// Identifier the parent image must carry, if this is a differential image
    pub fn parent_identifier(&self) -> Option<Guid> {
        self.parent_identifier
    }

    /// Parent filename hint recorded in the image, decoded to UTF-8
    pub fn parent_filename(&self) -> Option<&str> {
        self.parent_filename.as_deref()
    }

    /// Whether unallocated regions defer to a parent image
    pub fn has_parent(&self) -> bool {
        self.disk_type == DiskType::Differential
    }

    /// Whether the image was captured with a saved machine state (VHD only)
    pub fn saved_state(&self) -> bool {
        self.saved_state
    }

    /// Advisory disk geometry (VHD only)
    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.geometry
    }

    /// The block allocation table, absent for fixed VHD images
    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.bat.as_ref()
    }

    /// Check the structural invariants that must hold after loading
    ///
    /// Called by the format loaders before a descriptor is exposed; a
    /// violation fails the whole open.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.bytes_per_sector == 0 || self.media_size % u64::from(self.bytes_per_sector) != 0 {
            return Err(Error::malformed(format!(
                "media size {} is not a multiple of the sector size {}",
                self.media_size, self.bytes_per_sector
            )));
        }

        if let Some(bat) = &self.bat {
            let block_size = bat.block_size();
            if !block_size.is_power_of_two() || block_size % self.bytes_per_sector != 0 {
                return Err(Error::malformed(format!(
                    "block size {} is not a power-of-two multiple of the sector size {}",
                    block_size, self.bytes_per_sector
                )));
            }

            let required = self.media_size.div_ceil(u64::from(block_size));
            if (bat.len() as u64) < required {
                return Err(Error::malformed(format!(
                    "block allocation table has {} entries, {} required",
                    bat.len(),
                    required
                )));
            }
        }

        if self.disk_type == DiskType::Differential {
            match self.parent_identifier {
                Some(identifier) if !identifier.is_nil() => {}
                _ => {
                    return Err(Error::parent_mismatch(
                        "differential image carries no parent identifier",
                    ))
                }
            }
        }

        Ok(())
    }
}
