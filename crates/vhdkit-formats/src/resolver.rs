//! Logical-offset to span resolution
//!
//! [`resolve_span`] maps a logical byte offset to the longest contiguous
//! range that can be satisfied from a single place: the image file, the
//! parent image, or a zero fill. Spans never cross a block boundary or a
//! sector-bitmap run boundary, so the read loop can dispatch each span with
//! one operation.
//!
//! Resolution is a pure function of the descriptor; concurrent calls on the
//! same descriptor return identical results.

use crate::bat::BlockState;
use crate::descriptor::ImageDescriptor;
use vhdkit_core::{Error, Result};

/// Where the bytes of a span come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Zero fill
    Zero,
    /// The image file, at the span's physical offset
    Physical,
    /// The parent image, at the span's logical offset
    Parent,
}

/// One contiguous resolved range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub kind: SpanKind,
    /// Physical file offset for [`SpanKind::Physical`], logical disk offset
    /// for [`SpanKind::Parent`] and [`SpanKind::Zero`]
    pub offset: u64,
    /// Span length in bytes; always greater than zero
    pub length: u64,
}

/// Resolve the span starting at `logical`, at most `max_len` bytes long
///
/// # Errors
///
/// Returns [`Error::Argument`] if `logical` is at or beyond the media size
/// or `max_len` is zero; callers clamp before resolving.
pub fn resolve_span(descriptor: &ImageDescriptor, logical: u64, max_len: u64) -> Result<Span> {
    let media_size = descriptor.media_size();
    if logical >= media_size {
        return Err(Error::argument(format!(
            "offset {} is beyond the media size {}",
            logical, media_size
        )));
    }
    if max_len == 0 {
        return Err(Error::argument("span length must be greater than zero"));
    }

    let media_remaining = media_size - logical;

    let bat = match descriptor.bat() {
        Some(bat) => bat,
        None => {
            // Fixed VHD: the logical disk maps 1:1 onto the file start.
            return Ok(Span {
                kind: SpanKind::Physical,
                offset: logical,
                length: max_len.min(media_remaining),
            });
        }
    };

    let block_size = u64::from(bat.block_size());
    let block = logical / block_size;
    let offset_in_block = logical % block_size;
    let block_remaining = block_size - offset_in_block;
    let length = max_len.min(block_remaining).min(media_remaining);

    let span = match bat.state_of(block) {
        BlockState::Present(physical) => Span {
            kind: SpanKind::Physical,
            offset: physical + offset_in_block,
            length,
        },
        BlockState::Zero => Span {
            kind: SpanKind::Zero,
            offset: logical,
            length,
        },
        BlockState::NotPresent => Span {
            kind: if descriptor.has_parent() {
                SpanKind::Parent
            } else {
                SpanKind::Zero
            },
            offset: logical,
            length,
        },
        BlockState::PartiallyPresent { offset, bitmap } => {
            let bytes_per_sector = u64::from(descriptor.bytes_per_sector());
            let sector = (offset_in_block / bytes_per_sector) as u32;
            let run = u64::from(bitmap.run_length(sector));
            let run_end = (u64::from(sector) + run) * bytes_per_sector;
            let run_remaining = run_end - offset_in_block;

            if bitmap.is_set(sector) {
                Span {
                    kind: SpanKind::Physical,
                    offset: offset + offset_in_block,
                    length: length.min(run_remaining),
                }
            } else {
                Span {
                    kind: if descriptor.has_parent() {
                        SpanKind::Parent
                    } else {
                        SpanKind::Zero
                    },
                    offset: logical,
                    length: length.min(run_remaining),
                }
            }
        }
    };

    debug_assert!(span.length > 0);
    Ok(span)
}
