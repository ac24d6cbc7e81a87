//! # vhdkit Formats
//!
//! Read-only decoding of Microsoft Virtual Hard Disk containers.
//!
//! This crate implements both container generations behind one interface:
//! - **VHD** (version 1): footer, dynamic header, big-endian BAT, per-block
//!   sector bitmaps, parent locators
//! - **VHDX** (version 2): file type identifier, header pair with CRC-32C
//!   and sequence arbitration, region table, metadata table, little-endian
//!   BAT with interleaved sector bitmaps
//!
//! An opened [`DiskImage`] presents the flat logical disk: every read is
//! resolved per span to the image file, the parent image of a differencing
//! chain, or a zero fill.
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdkit_formats::open_image;
//! use vhdkit_core::ImageOptions;
//! use std::path::Path;
//!
//! let mut image = open_image(Path::new("disk.vhdx"), &ImageOptions::default()).unwrap();
//! println!("{} bytes, {} per sector", image.media_size(), image.bytes_per_sector());
//!
//! let mut sector = vec![0u8; 512];
//! image.read_at(0, &mut sector).unwrap();
//! ```

pub mod bat;
pub mod chain;
pub mod checksum;
pub mod descriptor;
pub mod factory;
pub mod image;
pub mod resolver;
pub mod vhd;
pub mod vhdx;

#[cfg(test)]
pub(crate) mod testimg;

// Re-export commonly used items
pub use bat::{BlockAllocationTable, BlockState, SectorBitmap};
pub use chain::ImageChain;
pub use descriptor::ImageDescriptor;
pub use factory::{detect_format, open_image, open_source};
pub use image::DiskImage;
pub use resolver::{resolve_span, Span, SpanKind};
