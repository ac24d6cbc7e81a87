//! Image chains
//!
//! An [`ImageChain`] ties a descriptor to its byte source and, for
//! differential images, to the chain of the parent image. The chain read
//! path drives the resolver span by span and dispatches each span to the
//! right place.

use crate::descriptor::ImageDescriptor;
use crate::resolver::{resolve_span, SpanKind};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vhdkit_core::{ByteSource, DiskType, Error, Result};

/// Number of times a short source read is retried before it is surfaced
const SHORT_READ_RETRIES: u32 = 3;

/// A descriptor, its byte source, and an optional parent chain
pub struct ImageChain {
    descriptor: ImageDescriptor,
    source: Box<dyn ByteSource>,
    parent: Option<Box<ImageChain>>,
    abort: Arc<AtomicBool>,
}

impl ImageChain {
    pub(crate) fn new(descriptor: ImageDescriptor, source: Box<dyn ByteSource>) -> Self {
        Self {
            descriptor,
            source,
            parent: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The image descriptor
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// The attached parent chain, if any
    pub fn parent(&self) -> Option<&ImageChain> {
        self.parent.as_deref()
    }

    /// Request that in-flight and future reads stop with [`Error::Aborted`]
    ///
    /// The flag is checked between spans and between parent-chain hops, so a
    /// read stops within at most one block's worth of bytes.
    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Shared handle to the abort flag
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Attach the parent image of a differential image
    ///
    /// # Errors
    ///
    /// - [`Error::Argument`] if this image is not differential or already has
    ///   a parent attached
    /// - [`Error::ParentMismatch`] if the parent's identifier does not equal
    ///   the recorded parent identifier, or the chain would contain a cycle
    pub fn attach_parent(&mut self, parent: ImageChain) -> Result<()> {
        if self.descriptor.disk_type() != DiskType::Differential {
            return Err(Error::argument(
                "parent images can only be attached to differential images",
            ));
        }
        if self.parent.is_some() {
            return Err(Error::argument("a parent image is already attached"));
        }

        let expected = self
            .descriptor
            .parent_identifier()
            .expect("differential descriptor always carries a parent identifier");
        let actual = parent.descriptor.identifier();
        if actual != expected {
            return Err(Error::parent_mismatch(format!(
                "parent identifier {} does not match the expected identifier {}",
                actual, expected
            )));
        }

        // Reject cycles: the identifier of this image must not reappear
        // anywhere up the chain being attached.
        let own = self.descriptor.identifier();
        let mut link = Some(&parent);
        while let Some(chain) = link {
            if chain.descriptor.identifier() == own {
                return Err(Error::parent_mismatch(format!(
                    "parent chain cycles back to identifier {}",
                    own
                )));
            }
            link = chain.parent.as_deref();
        }

        let mut parent = parent;
        parent.share_abort_flag(&self.abort);
        self.parent = Some(Box::new(parent));
        Ok(())
    }

    /// Propagate one abort flag down the whole chain so that a single
    /// `signal_abort` stops reads at every level
    fn share_abort_flag(&mut self, flag: &Arc<AtomicBool>) {
        self.abort = Arc::clone(flag);
        if let Some(parent) = self.parent.as_mut() {
            parent.share_abort_flag(flag);
        }
    }

    /// Read into `buf` starting at the logical `offset`
    ///
    /// Returns the number of bytes read; reads clamp at the media size and
    /// return 0 at or beyond it.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let media_size = self.descriptor.media_size();
        if offset >= media_size || buf.is_empty() {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(media_size - offset) as usize;
        let mut done = 0usize;

        while done < want {
            if self.abort.load(Ordering::Relaxed) {
                return Err(Error::Aborted);
            }

            let logical = offset + done as u64;
            let span = resolve_span(&self.descriptor, logical, (want - done) as u64)?;
            let end = done + span.length as usize;

            match span.kind {
                SpanKind::Zero => buf[done..end].fill(0),
                SpanKind::Physical => {
                    read_physical(self.source.as_mut(), span.offset, &mut buf[done..end])?
                }
                SpanKind::Parent => {
                    let parent = self.parent.as_mut().ok_or_else(|| {
                        Error::parent_mismatch(
                            "differential image read requires a parent, but none is attached",
                        )
                    })?;
                    let count = parent.read_at(logical, &mut buf[done..end])?;
                    if count < span.length as usize {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "parent image ended at offset {} inside a deferred span",
                                logical + count as u64
                            ),
                        )));
                    }
                }
            }

            done = end;
        }

        Ok(done)
    }
}

/// Fill `buf` from the byte source at `offset`, retrying bounded short reads
fn read_physical(source: &mut dyn ByteSource, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    let mut short_reads = 0u32;

    while filled < buf.len() {
        let count = source.read_at(offset + filled as u64, &mut buf[filled..])?;
        filled += count;

        if filled < buf.len() {
            short_reads += 1;
            if short_reads >= SHORT_READ_RETRIES {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read at offset {}: got {} of {} bytes",
                        offset,
                        filled,
                        buf.len()
                    ),
                )));
            }
        }
    }
    Ok(())
}
