//! Inbound network stream buffer
//!
//! Holds the segments delivered by the receive path for one device, oldest
//! first, without copying them. Consumers copy byte ranges out by logical
//! offset (0 = oldest buffered byte) and release what they have consumed
//! from the front.
//!
//! # Resumable copies
//!
//! A consumer that reassembles a protocol header before it knows the payload
//! length reads the stream in small sequential pieces. Every [`copy`] returns
//! a [`CopyCursor`] recording where it stopped; passing that cursor to the
//! next copy resumes the scan there instead of walking from the head, so a
//! full drain is linear in the number of segments.
//!
//! The buffer is not internally synchronized. One producer appends and one
//! consumer drains, serialized by the owning device's lock. A cursor is only
//! valid until the next [`release`]; every eviction bumps a generation
//! counter and a stale cursor is rejected.
//!
//! [`copy`]: InboundStreamBuffer::copy
//! [`release`]: InboundStreamBuffer::release

use bytes::{Buf, Bytes};
use common::{Error, Result};
use std::collections::VecDeque;
use tracing::trace;

/// One received network indication, referenced rather than copied
pub type Segment = Bytes;

/// Read position returned by [`InboundStreamBuffer::copy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCursor {
    /// Segment holding the next unread byte
    index: usize,
    /// Offset of that byte inside the segment
    offset: usize,
    /// Logical stream position of that byte
    position: usize,
    /// Buffer generation the cursor was produced in
    generation: u64,
}

impl CopyCursor {
    /// Logical offset the next sequential copy starts at
    pub fn position(&self) -> usize {
        self.position
    }
}

#[derive(Debug, Default)]
pub struct InboundStreamBuffer {
    /// Oldest first; never holds an empty segment
    segments: VecDeque<Segment>,
    /// Sum of all segment lengths
    size: usize,
    /// Bumped on every eviction
    generation: u64,
}

impl InboundStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment, taking ownership of it
    ///
    /// Empty segments carry nothing and are dropped.
    pub fn push(&mut self, segment: Segment) {
        if segment.is_empty() {
            return;
        }
        self.size += segment.len();
        self.segments.push_back(segment);
        trace!(
            "stream push: segments={}, size={}",
            self.segments.len(),
            self.size
        );
    }

    /// Total buffered byte count
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Copy `dest.len()` bytes starting at logical byte `offset`
    ///
    /// With a cursor, the scan resumes at the cursor's position; `offset`
    /// must not lie before it. Fails with [`Error::InsufficientData`] when
    /// the range is not fully buffered yet, leaving `dest` untouched.
    pub fn copy(
        &self,
        dest: &mut [u8],
        offset: usize,
        cursor: Option<&CopyCursor>,
    ) -> Result<CopyCursor> {
        let len = dest.len();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::Parameter(format!("copy range overflows: {offset}+{len}")))?;

        if end > self.size {
            return Err(Error::InsufficientData {
                requested: end,
                available: self.size,
            });
        }

        let (mut index, mut seg_offset, mut skip) = match cursor {
            Some(c) => {
                if c.generation != self.generation {
                    return Err(Error::Parameter(format!(
                        "stale copy cursor: generation {} != {}",
                        c.generation, self.generation
                    )));
                }
                if offset < c.position {
                    return Err(Error::Parameter(format!(
                        "copy offset {} precedes cursor position {}",
                        offset, c.position
                    )));
                }
                (c.index, c.offset, offset - c.position)
            }
            None => (0, 0, offset),
        };

        // Skip to `offset`; whole segments are stepped over without touching their data
        while skip > 0 {
            let avail = self.segments[index].len() - seg_offset;
            if skip < avail {
                seg_offset += skip;
                skip = 0;
            } else {
                skip -= avail;
                index += 1;
                seg_offset = 0;
            }
        }

        let mut copied = 0;
        while copied < len {
            let segment = &self.segments[index];
            let n = (segment.len() - seg_offset).min(len - copied);

            dest[copied..copied + n].copy_from_slice(&segment[seg_offset..seg_offset + n]);
            copied += n;
            seg_offset += n;

            if seg_offset == segment.len() {
                index += 1;
                seg_offset = 0;
            }
        }

        Ok(CopyCursor {
            index,
            offset: seg_offset,
            position: end,
            generation: self.generation,
        })
    }

    /// Discard `len` bytes from the front
    ///
    /// Fully consumed leading segments are dropped, which hands their memory
    /// back to the receive path; a partially consumed head segment is
    /// trimmed in place. Rejects `len > size()` without changing anything.
    pub fn release(&mut self, len: usize) -> Result<()> {
        if len > self.size {
            return Err(Error::Parameter(format!(
                "release of {} bytes exceeds {} buffered",
                len, self.size
            )));
        }
        if len == 0 {
            return Ok(());
        }

        let mut remaining = len;
        while remaining > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= remaining {
                remaining -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        debug_assert_eq!(remaining, 0);

        self.size -= len;
        self.generation += 1;

        trace!(
            "stream release: {} bytes, segments={}, size={}",
            len,
            self.segments.len(),
            self.size
        );
        Ok(())
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        if !self.segments.is_empty() {
            self.segments.clear();
            self.size = 0;
            self.generation += 1;
        }
    }
}
