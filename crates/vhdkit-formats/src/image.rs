//! The opened-image handle
//!
//! [`DiskImage`] pairs an [`ImageChain`] with a read position, exposing the
//! flat logical disk through `read_at` and the standard `Read`/`Seek`
//! traits. Accessors surface the descriptor metadata.
//!
//! A `DiskImage` holds mutable cursor state; share it across threads only
//! with external synchronization. The abort flag is the exception: it can be
//! cloned out and flipped from any thread.

use crate::chain::ImageChain;
use crate::descriptor::ImageDescriptor;
use crate::vhd::types::DiskGeometry;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use vhdkit_core::{ContainerFormat, DiskType, Guid, Result};

/// An opened VHD or VHDX image presented as a flat logical disk
pub struct DiskImage {
    chain: ImageChain,
    position: u64,
}

impl DiskImage {
    pub(crate) fn new(chain: ImageChain) -> Self {
        Self { chain, position: 0 }
    }

    /// The full image descriptor
    pub fn descriptor(&self) -> &ImageDescriptor {
        self.chain.descriptor()
    }

    /// Container format of the image
    pub fn format(&self) -> ContainerFormat {
        self.descriptor().format()
    }

    /// Format version as (major, minor)
    pub fn format_version(&self) -> (u16, u16) {
        self.descriptor().format_version()
    }

    /// Disk type of the image
    pub fn disk_type(&self) -> DiskType {
        self.descriptor().disk_type()
    }

    /// Logical disk size in bytes
    pub fn media_size(&self) -> u64 {
        self.descriptor().media_size()
    }

    /// Logical sector size in bytes
    pub fn bytes_per_sector(&self) -> u32 {
        self.descriptor().bytes_per_sector()
    }

    /// Allocation block size in bytes; 0 for fixed VHD images
    pub fn block_size(&self) -> u32 {
        self.descriptor().block_size()
    }

    /// Identifier of this image
    pub fn identifier(&self) -> Guid {
        self.descriptor().identifier()
    }

    /// Identifier the parent must carry, for differential images
    pub fn parent_identifier(&self) -> Option<Guid> {
        self.descriptor().parent_identifier()
    }

    /// Parent filename hint recorded in the image
    pub fn parent_filename(&self) -> Option<&str> {
        self.descriptor().parent_filename()
    }

    /// File name component of the parent filename hint
    ///
    /// Parent paths are recorded by Windows producers, so the name is taken
    /// after the last backslash (or slash).
    pub fn parent_basename(&self) -> Option<&str> {
        self.parent_filename()
            .map(|name| match name.rfind(['\\', '/']) {
                Some(index) => &name[index + 1..],
                None => name,
            })
    }

    /// Advisory disk geometry (VHD only)
    pub fn geometry(&self) -> Option<DiskGeometry> {
        self.descriptor().geometry()
    }

    /// Whether the image was captured with a saved machine state (VHD only)
    pub fn saved_state(&self) -> bool {
        self.descriptor().saved_state()
    }

    /// Attach the parent image of a differential image
    ///
    /// Must happen before the first read that touches an unallocated region.
    /// See [`ImageChain::attach_parent`] for the failure modes.
    pub fn attach_parent(&mut self, parent: DiskImage) -> Result<()> {
        self.chain.attach_parent(parent.chain)
    }

    /// The attached parent chain, if any
    pub fn parent(&self) -> Option<&ImageChain> {
        self.chain.parent()
    }

    /// Request that in-flight and future reads stop with `Aborted`
    pub fn signal_abort(&self) {
        self.chain.signal_abort()
    }

    /// Shared handle to the abort flag
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.chain.abort_flag()
    }

    /// Read into `buf` at the logical `offset`, without moving the cursor
    ///
    /// Returns the number of bytes read; 0 at or beyond the media size.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.chain.read_at(offset, buf)
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for DiskImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.chain.read_at(self.position, buf)?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for DiskImage {
    /// Seeks beyond the media end are permitted; subsequent reads return 0.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_position = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.media_size() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_position < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before beginning of image",
            ));
        }

        self.position = new_position as u64;
        Ok(self.position)
    }
}
