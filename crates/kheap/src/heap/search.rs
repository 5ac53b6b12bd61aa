use super::{Heap, Hole};
use crate::{
    block::{HEADER_SIZE, MIN_BLOCK_SIZE},
    page::{PAGE_SIZE, page_round_up},
};

/// A hole chosen to serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Fit {
    /// Rank of the hole in the index.
    pub(super) rank: usize,
    pub(super) hole: Hole,
    /// Bytes skipped at the front of the hole so the payload is page-aligned.
    pub(super) offset: usize,
}

/// Distance from the hole at `header` to the block placement whose payload
/// starts on a page boundary.
///
/// A non-zero gap must hold a hole of its own, so a gap shorter than
/// [`MIN_BLOCK_SIZE`] moves the placement one page further.
pub(super) fn page_align_offset(header: usize) -> Option<usize> {
    let payload = header.checked_add(HEADER_SIZE)?;
    let offset = page_round_up(payload)? - payload;
    if offset == 0 || offset >= MIN_BLOCK_SIZE {
        Some(offset)
    } else {
        offset.checked_add(PAGE_SIZE)
    }
}

impl<const CAP: usize> Heap<CAP> {
    /// Finds the smallest hole that can hold a block of `block_size` bytes.
    ///
    /// The index is scanned from the smallest hole upwards. With
    /// `page_align`, each hole's capacity is reduced by the gap needed to
    /// page-align the payload, so a hole large enough by size alone may still
    /// be skipped in favour of a larger one.
    pub(super) fn find_hole(&self, block_size: usize, page_align: bool) -> Option<Fit> {
        self.index.iter().enumerate().find_map(|(rank, hole)| {
            let offset = if page_align {
                page_align_offset(hole.header)?
            } else {
                0
            };
            let usable = hole.size.checked_sub(offset)?;
            (usable >= block_size).then_some(Fit {
                rank,
                hole: *hole,
                offset,
            })
        })
    }
}
