//! 128-bit identifiers and their two wire encodings
//!
//! VHD stores the first three GUID fields big-endian; VHDX stores them
//! little-endian. [`Guid`] always holds the canonical (big-endian, RFC 4122)
//! byte order, so equality is a plain byte compare regardless of which
//! container the value came from.

use crate::error::{Error, Result};
use std::fmt;
use uuid::Uuid;

/// A 128-bit identifier in canonical byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The all-zero identifier
    pub const NIL: Guid = Guid([0u8; 16]);

    /// Create a GUID from canonical (big-endian field) bytes
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    /// Create a GUID from the VHD wire encoding (fields stored big-endian)
    ///
    /// The VHD encoding matches the canonical order, so this is a plain copy.
    pub const fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Guid(bytes)
    }

    /// Create a GUID from the VHDX wire encoding (first three fields
    /// stored little-endian)
    pub const fn from_le_bytes(b: [u8; 16]) -> Self {
        Guid([
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ])
    }

    /// The canonical bytes
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The VHDX wire encoding of this GUID
    pub const fn to_le_bytes(&self) -> [u8; 16] {
        let b = &self.0;
        [
            b[3], b[2], b[1], b[0],
            b[5], b[4],
            b[7], b[6],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        ]
    }

    /// Whether this is the all-zero identifier
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Parse a GUID from its string form, with or without surrounding braces
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_start_matches('{').trim_end_matches('}');
        let uuid = Uuid::parse_str(trimmed)
            .map_err(|e| Error::malformed(format!("invalid GUID string '{}': {}", text, e)))?;
        Ok(Guid(*uuid.as_bytes()))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}
