//! # vhdkit Core
//!
//! Core traits, types, and error handling for vhdkit.
//!
//! This crate provides the foundational abstractions for read-only access to
//! Microsoft Virtual Hard Disk images:
//! - **Errors**: one [`Error`] taxonomy shared by every crate
//! - **ByteSource**: the random-access reader an opened image consumes
//! - **Guid**: 128-bit identifiers with the two wire encodings the formats use
//! - **Shared enums**: disk types and container formats
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdkit_core::ByteSource;
//!
//! fn dump_size(source: &dyn ByteSource) {
//!     println!("source is {} bytes", source.size());
//! }
//! ```

pub mod error;
pub mod guid;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{Error, Result};
pub use guid::Guid;
pub use traits::ByteSource;
pub use types::{ContainerFormat, DiskType, ImageOptions};
