//! Plain file byte source

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use vhdkit_core::ByteSource;

/// A byte source backed by a regular file, using seek-and-read access
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Open a file as a byte source
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its metadata read.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already-open file
    pub fn from_file(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;

        let available = (self.size - offset) as usize;
        let to_read = buf.len().min(available);

        let mut filled = 0usize;
        while filled < to_read {
            let count = self.file.read(&mut buf[filled..to_read])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_test_file(data: &[u8]) -> NamedTempFile {
        let mut tmpfile = NamedTempFile::new().unwrap();
        tmpfile.write_all(data).unwrap();
        tmpfile.flush().unwrap();
        tmpfile
    }

    #[test]
    fn test_file_source_size() {
        let data: Vec<u8> = (0..100).collect();
        let tmpfile = write_test_file(&data);

        let source = FileSource::open(tmpfile.path()).unwrap();
        assert_eq!(source.size(), 100);
    }

    #[test]
    fn test_file_source_read_at() {
        let data: Vec<u8> = (0..100).collect();
        let tmpfile = write_test_file(&data);

        let mut source = FileSource::open(tmpfile.path()).unwrap();

        let mut buf = [0u8; 10];
        let count = source.read_at(20, &mut buf).unwrap();
        assert_eq!(count, 10);
        assert_eq!(&buf, &[20, 21, 22, 23, 24, 25, 26, 27, 28, 29]);
    }

    #[test]
    fn test_file_source_short_read_at_end() {
        let data: Vec<u8> = (0..100).collect();
        let tmpfile = write_test_file(&data);

        let mut source = FileSource::open(tmpfile.path()).unwrap();

        let mut buf = [0u8; 10];
        let count = source.read_at(95, &mut buf).unwrap();
        assert_eq!(count, 5);
        assert_eq!(&buf[..5], &[95, 96, 97, 98, 99]);

        let count = source.read_at(100, &mut buf).unwrap();
        assert_eq!(count, 0);

        let count = source.read_at(5000, &mut buf).unwrap();
        assert_eq!(count, 0);
    }
}
