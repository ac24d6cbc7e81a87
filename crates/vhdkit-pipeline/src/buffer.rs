//! In-memory byte source

use std::io;
use vhdkit_core::ByteSource;

/// A byte source over an in-memory buffer
///
/// Mostly useful for tests and for images that were already read into memory
/// by the caller.
pub struct BufferSource {
    data: Vec<u8>,
}

impl BufferSource {
    /// Wrap a byte vector
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The underlying bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for BufferSource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl ByteSource for BufferSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }
}
