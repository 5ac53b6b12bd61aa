//! The heap state and the operations that move its bounds.
//!
//! # Memory Layout
//!
//! ```text
//! heap_start                     start (page-aligned)                  end          max
//! ├─ hole index storage ─┬─ pad ─┼─ block ─┬─ block ─┬─ ... ─┬─ block ─┤ ... room ... │
//! ```
//!
//! The hole index is written into the first bytes of the memory handed to
//! [`Heap::create`]; blocks start at the next page boundary after it. `end`
//! moves between `start` and `max` as the heap grows and shrinks.

use core::ptr::NonNull;

use snafu::{OptionExt as _, ResultExt as _, ensure};
use sorted_array::SortedArray;

use crate::{
    block::{BLOCK_ALIGN, BlockHeader, MIN_BLOCK_SIZE},
    error::{
        AdjacentHolesSnafu, CheckError, CorruptSnafu, InUseSnafu, IndexMismatchSnafu,
        NotIndexedSnafu, OutOfBoundsSnafu, ResizeCorruptSnafu, ResizeError, ResizeIndexFullSnafu,
        UnorderedSnafu,
    },
    page::{PAGE_SIZE, align_up, page_round_up},
    region::{Blocks, Region},
};

mod allocate;
mod free;
mod search;

/// Capacity of the hole index unless chosen otherwise.
pub const DEFAULT_INDEX_CAPACITY: usize = 128;

/// Entry of the hole index.
///
/// Holes are ordered by size, then by address, so the index lists the
/// smallest hole first and each hole has exactly one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hole {
    size: usize,
    header: usize,
}

impl Hole {
    /// Total span of the hole, tags included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of the hole's header.
    #[must_use]
    pub fn address(&self) -> usize {
        self.header
    }
}

/// Summary of the heap contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Current span `end - start`.
    pub heap_size: usize,
    pub hole_count: usize,
    /// Bytes covered by holes, tags included.
    pub free_bytes: usize,
    /// Bytes covered by allocated blocks, tags included.
    pub used_bytes: usize,
}

/// A heap managing one contiguous memory region.
///
/// The heap keeps free blocks ("holes") in a size-ordered index of at most
/// `CAP` entries and serves requests from the smallest hole that fits,
/// growing towards its limit when none does.
///
/// # Thread Safety
///
/// The heap is `Send` but not `Sync`. Wrap it in a lock (see
/// [`LockedHeap`](crate::LockedHeap)) to share it.
pub struct Heap<const CAP: usize = DEFAULT_INDEX_CAPACITY> {
    region: Region,
    max: usize,
    index: SortedArray<Hole, CAP>,
}

// SAFETY: the heap exclusively owns its region and the index storage in it
unsafe impl<const CAP: usize> Send for Heap<CAP> {}

impl<const CAP: usize> Heap<CAP> {
    /// Creates a heap in `heap_start..heap_end` that may grow up to
    /// `heap_max`.
    ///
    /// The hole index is placed at `heap_start`, the first block starts at
    /// the page boundary following it and initially spans the rest of the
    /// region as one hole.
    ///
    /// # Panics
    ///
    /// Panics if `heap_start` is null, if the addresses are out of order or
    /// if the region cannot hold the index plus one hole.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `heap_start..heap_max` is valid for reads and writes, and pointers
    ///   derived from `heap_start` may access all of it
    /// - The memory is not used by anything else while the heap exists
    pub unsafe fn create(heap_start: *mut u8, heap_end: *mut u8, heap_max: *mut u8) -> Self {
        let base = NonNull::new(heap_start).expect("heap start must not be null");
        let (base_addr, end, max) = (heap_start.addr(), heap_end.addr(), heap_max.addr());
        assert!(base_addr < end && end <= max, "heap bounds out of order");

        let layout = SortedArray::<Hole, CAP>::storage_layout();
        let index_addr = align_up(base_addr, layout.align()).expect("heap start overflows");
        let start = index_addr
            .checked_add(layout.size())
            .and_then(page_round_up)
            .expect("hole index overflows the address space");
        let end = end - end % BLOCK_ALIGN;
        assert!(
            start.checked_add(MIN_BLOCK_SIZE).is_some_and(|min_end| min_end <= end),
            "heap region too small for the hole index"
        );

        // SAFETY: the index storage and the blocks lie in `heap_start..heap_end`
        let (region, index) = unsafe {
            let index_ptr = base.byte_add(index_addr - base_addr);
            (
                Region::new(base, start, end),
                SortedArray::place(index_ptr),
            )
        };
        let mut heap = Self { region, max, index };
        heap.insert_hole(start, end - start);

        log::debug!(
            "heap created: blocks {start:#x}..{end:#x}, max {max:#x}, index of {CAP} holes at {index_addr:#x}"
        );
        heap
    }

    /// Address of the first block.
    #[must_use]
    pub fn start(&self) -> usize {
        self.region.start()
    }

    /// End of the managed region.
    #[must_use]
    pub fn end(&self) -> usize {
        self.region.end()
    }

    /// Limit `end` may never cross.
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Current span `end - start`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.end() - self.start()
    }

    /// Changes the span of the heap to `new_size` bytes, rounded up to whole
    /// pages.
    ///
    /// Growing registers the new tail as a hole, merged with the last block
    /// if that one is free. If the last block is allocated and the tail would
    /// be too short for a hole, the heap grows by one more page. Shrinking cuts the tail off the last block, which
    /// must be a hole; what remains of it must either vanish or still form a
    /// valid hole.
    ///
    /// # Errors
    ///
    /// - [`ResizeError::OutOfBounds`] if the new end would cross `max`
    /// - [`ResizeError::InUse`] if a shrink would cut into an allocated block
    /// - [`ResizeError::ResizeIndexFull`] if the new tail needs an index
    ///   entry and none is left
    /// - [`ResizeError::ResizeCorrupt`] if the last block's metadata is
    ///   damaged
    ///
    /// The heap is left unchanged on error.
    pub fn resize(&mut self, new_size: usize) -> Result<(), ResizeError> {
        let new_end = page_round_up(new_size)
            .and_then(|size| self.start().checked_add(size))
            .context(OutOfBoundsSnafu {
                requested_end: usize::MAX,
                max: self.max,
            })?;
        let old_end = self.end();
        if new_end > old_end {
            ensure!(
                new_end <= self.max,
                OutOfBoundsSnafu {
                    requested_end: new_end,
                    max: self.max,
                }
            );
            self.grow_to(new_end)?;
        } else if new_end < old_end {
            self.shrink_to(new_end)?;
        }
        Ok(())
    }

    /// Returns trailing free pages by shrinking the heap to the smallest
    /// page-aligned span that still holds every allocated block, but not
    /// below `min_size`.
    ///
    /// Returns the number of bytes released.
    ///
    /// # Errors
    ///
    /// Returns [`ResizeError::ResizeCorrupt`] if the last block's metadata is
    /// damaged.
    pub fn trim(&mut self, min_size: usize) -> Result<usize, ResizeError> {
        let Some((hole, header)) = self.last_block()? else {
            return Ok(0);
        };
        if header.is_allocated() {
            return Ok(0);
        }

        let Some(mut target) = page_round_up(hole - self.start()) else {
            return Ok(0);
        };
        let cut = self.start() + target - hole;
        if cut > 0 && cut < MIN_BLOCK_SIZE {
            target += PAGE_SIZE;
        }
        let floor = page_round_up(min_size).unwrap_or(usize::MAX);
        let target = usize::max(target, floor);
        let old_size = self.size();
        if target >= old_size {
            return Ok(0);
        }

        self.resize(target)?;
        log::debug!("heap trimmed by {:#x} bytes to end at {:#x}", old_size - target, self.end());
        Ok(old_size - target)
    }

    fn last_block(&self) -> Result<Option<(usize, BlockHeader)>, ResizeError> {
        // SAFETY: `end` is a block boundary of a region valid per `create`
        unsafe { self.region.block_before(self.end()) }.context(ResizeCorruptSnafu)
    }

    fn grow_to(&mut self, new_end: usize) -> Result<(), ResizeError> {
        let old_end = self.end();
        match self.last_block()? {
            Some((hole, header)) if !header.is_allocated() => {
                self.remove_hole(hole, header.size());
                self.region.set_end(new_end);
                self.insert_hole(hole, new_end - hole);
            }
            _ => {
                // a tail too short to be a hole takes one more page
                let new_end = if new_end - old_end < MIN_BLOCK_SIZE {
                    let requested_end = new_end.saturating_add(PAGE_SIZE);
                    ensure!(
                        requested_end <= self.max,
                        OutOfBoundsSnafu {
                            requested_end,
                            max: self.max,
                        }
                    );
                    requested_end
                } else {
                    new_end
                };
                ensure!(
                    !self.index.is_full(),
                    ResizeIndexFullSnafu { capacity: CAP }
                );
                self.region.set_end(new_end);
                self.insert_hole(old_end, new_end - old_end);
            }
        }
        log::debug!("heap grown from {old_end:#x} to {:#x}", self.end());
        Ok(())
    }

    fn shrink_to(&mut self, new_end: usize) -> Result<(), ResizeError> {
        let Some((hole, header)) = self.last_block()? else {
            return InUseSnafu { new_end }.fail();
        };
        let remaining = new_end.checked_sub(hole);
        let fits = !header.is_allocated()
            && remaining.is_some_and(|rest| rest == 0 || rest >= MIN_BLOCK_SIZE);
        ensure!(fits, InUseSnafu { new_end });

        self.remove_hole(hole, header.size());
        self.region.set_end(new_end);
        if new_end > hole {
            self.insert_hole(hole, new_end - hole);
        }
        Ok(())
    }

    /// Writes a free block and registers it in the index.
    ///
    /// Callers make sure the index has room beforehand.
    fn insert_hole(&mut self, addr: usize, size: usize) {
        // SAFETY: callers only pass spans of the region that no live block
        // overlaps
        unsafe {
            self.region.write_block(addr, size, false);
        }
        let hole = Hole { size, header: addr };
        if self.index.insert(hole).is_err() {
            panic!("hole index overflow while inserting {hole:?}");
        }
    }

    fn remove_hole(&mut self, addr: usize, size: usize) {
        let removed = self.index.remove_item(&Hole { size, header: addr });
        debug_assert!(removed.is_some(), "hole {addr:#x} missing from index");
    }

    /// Iterates over all blocks in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        // SAFETY: the region is valid memory per `create`
        unsafe { self.region.blocks() }
    }

    /// Iterates over the hole index, smallest hole first.
    pub fn holes(&self) -> impl Iterator<Item = &Hole> {
        self.index.iter()
    }

    /// Number of holes the index can hold.
    #[must_use]
    pub fn index_capacity(&self) -> usize {
        self.index.capacity()
    }

    /// Summarizes the heap from its hole index.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let free_bytes = self.index.iter().map(Hole::size).sum();
        HeapStats {
            heap_size: self.size(),
            hole_count: self.index.len(),
            free_bytes,
            used_bytes: self.size() - free_bytes,
        }
    }

    /// Walks the whole heap and verifies its invariants.
    ///
    /// - the blocks partition `start..end` exactly and all metadata validates
    /// - every free block is in the hole index and the index holds nothing
    ///   else
    /// - no two free blocks are adjacent
    /// - the index is sorted by size
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn check(&self) -> Result<HeapStats, CheckError> {
        ensure!(self.index.as_slice().is_sorted(), UnorderedSnafu);

        let mut free = 0;
        let mut prev_free = false;
        for block in self.blocks() {
            let block = block.context(CorruptSnafu)?;
            if block.allocated {
                prev_free = false;
                continue;
            }
            ensure!(
                !prev_free,
                AdjacentHolesSnafu {
                    address: block.address
                }
            );
            let hole = Hole {
                size: block.size,
                header: block.address,
            };
            ensure!(
                self.index.position(&hole).is_some(),
                NotIndexedSnafu {
                    address: block.address
                }
            );
            free += 1;
            prev_free = true;
        }
        ensure!(
            free == self.index.len(),
            IndexMismatchSnafu {
                indexed: self.index.len(),
                free,
            }
        );
        Ok(self.stats())
    }
}
