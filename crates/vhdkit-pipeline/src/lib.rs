//! # vhdkit Pipeline
//!
//! Byte source implementations for vhdkit.
//!
//! This crate provides the [`vhdkit_core::ByteSource`] backends an image can
//! be opened from:
//! - **FileSource**: plain seek-and-read access to a file
//! - **MmapSource**: memory-mapped file access
//! - **BufferSource**: an in-memory byte buffer
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdkit_pipeline::FileSource;
//! use vhdkit_core::ByteSource;
//! use std::path::Path;
//!
//! let mut source = FileSource::open(Path::new("disk.vhd")).unwrap();
//!
//! let mut buf = [0u8; 512];
//! source.read_at(0, &mut buf).unwrap();
//! ```

pub mod buffer;
pub mod file;
pub mod mmap;

pub use buffer::BufferSource;
pub use file::FileSource;
pub use mmap::MmapSource;
