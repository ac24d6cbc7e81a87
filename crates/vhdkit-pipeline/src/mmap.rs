//! Memory-mapped byte source

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;
use vhdkit_core::ByteSource;

/// Maximum file size accepted for memory mapping (16 GB)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// A byte source backed by a read-only memory-mapped file
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    /// Open a file with memory mapping
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    ///
    /// # Security
    ///
    /// Validates the file before mapping:
    /// - Ensures the file is a regular file (not device, pipe, etc.)
    /// - Checks the file size is within [`MAX_MMAP_SIZE`]
    /// - Uses a read-only mapping to prevent accidental writes
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping because:
    /// - The OS guarantees memory safety for valid file descriptors
    /// - We validate the file is a regular file before mapping
    /// - The mapping is read-only
    /// - The file must not be truncated during access (caller responsibility)
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Create a memory-mapped source from an existing file
    ///
    /// Validates the file before mapping (same checks as [`MmapSource::open`]).
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "File size {} exceeds memory mapping limit {} (16 GB)",
                    metadata.len(),
                    MAX_MMAP_SIZE
                ),
            ));
        }

        // SAFETY: the file is a regular file of bounded size and the file
        // descriptor is valid; the mapping is read-only.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap })
    }
}

impl ByteSource for MmapSource {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.mmap.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buf.len().min(self.mmap.len() - start);
        buf[..count].copy_from_slice(&self.mmap[start..start + count]);
        Ok(count)
    }
}
