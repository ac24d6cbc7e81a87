//! Shared types for vhdkit

use std::fmt;

/// Container format of an opened image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// Legacy VHD (version 1) container
    Vhd,
    /// VHDX (version 2) container
    Vhdx,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Vhd => write!(f, "VHD"),
            ContainerFormat::Vhdx => write!(f, "VHDX"),
        }
    }
}

/// Disk type of an image
///
/// Dynamic and differential images share the sparse block layout; a
/// differential image additionally defers unallocated regions to a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    /// All sectors stored contiguously
    Fixed,
    /// Sparse image; unallocated blocks read as zeros
    Dynamic,
    /// Sparse image backed by a parent for unallocated regions
    Differential,
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskType::Fixed => write!(f, "Fixed"),
            DiskType::Dynamic => write!(f, "Dynamic"),
            DiskType::Differential => write!(f, "Differential"),
        }
    }
}

/// Options for opening an image from a path
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Use memory-mapped I/O instead of plain file reads
    pub use_mmap: bool,
}
