//! Core traits for vhdkit

use std::io;

/// Random-access byte source backing an opened image
///
/// This is the only seam between the format decoder and the outside world.
/// Implementations exist for plain files, memory-mapped files and in-memory
/// buffers (see the `vhdkit-pipeline` crate).
///
/// Reads may be short only at end of source; a short read anywhere else is
/// treated as an I/O failure by callers.
pub trait ByteSource: Send {
    /// Total size of the source in bytes
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at the absolute `offset`
    ///
    /// Returns the number of bytes read. Reads past the end of the source
    /// return fewer bytes than requested, down to zero.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedEof` if the source ends before the buffer is full.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let count = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended at offset {} while reading {} bytes at offset {}",
                        offset + filled as u64,
                        buf.len(),
                        offset
                    ),
                ));
            }
            filled += count;
        }
        Ok(())
    }
}

impl ByteSource for Box<dyn ByteSource> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}
