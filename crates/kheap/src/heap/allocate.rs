use core::ptr::NonNull;

use snafu::{OptionExt as _, ResultExt as _, ensure};

use super::{Heap, search::Fit};
use crate::{
    block::{BLOCK_ALIGN, BLOCK_OVERHEAD, MIN_BLOCK_SIZE},
    error::{AllocError, AllocIndexFullSnafu, OutOfMemorySnafu, TooLargeSnafu},
    page::{PAGE_SIZE, align_up},
};

impl<const CAP: usize> Heap<CAP> {
    /// Allocates a block with at least `size` payload bytes.
    ///
    /// The payload is [`BLOCK_ALIGN`]-aligned, or page-aligned if
    /// `page_align` is set. The smallest hole that fits is used; if none
    /// does, the heap grows towards its limit and the search is repeated.
    ///
    /// A hole is split when the rest is large enough to form a hole of its
    /// own, otherwise the rest is handed out as part of the block. For
    /// page-aligned requests the skipped front of the hole stays a hole.
    ///
    /// # Errors
    ///
    /// - [`AllocError::TooLarge`] if `size` overflows the block arithmetic
    /// - [`AllocError::OutOfMemory`] if the heap cannot grow enough
    /// - [`AllocError::AllocIndexFull`] if splitting the chosen hole needs an
    ///   index entry and none is left
    ///
    /// On error the blocks are left as they were, although the heap may
    /// already have grown.
    pub fn allocate(&mut self, size: usize, page_align: bool) -> Result<NonNull<u8>, AllocError> {
        let block_size = align_up(size, BLOCK_ALIGN)
            .and_then(|size| size.checked_add(BLOCK_OVERHEAD))
            .context(TooLargeSnafu { size })?;

        // Each round either finds a hole or moves `end` strictly up, and
        // `end` is bounded by `max`.
        let fit = loop {
            if let Some(fit) = self.find_hole(block_size, page_align) {
                break fit;
            }
            self.grow_for(block_size, page_align)?;
        };

        let block = self.carve(fit, block_size)?;
        log::trace!("allocated {size:#x} bytes at {block:#x} (page aligned: {page_align})");
        Ok(self.region.payload(block))
    }

    fn grow_for(&mut self, block_size: usize, page_align: bool) -> Result<(), AllocError> {
        // a page-aligned block may start up to a page plus a minimal hole
        // into the new tail
        let extra = if page_align {
            block_size.saturating_add(PAGE_SIZE + MIN_BLOCK_SIZE)
        } else {
            block_size
        };
        self.resize(self.size().saturating_add(extra))
            .context(OutOfMemorySnafu { size: block_size })
    }

    /// Turns the hole of `fit` into an allocated block, returning its
    /// address.
    fn carve(&mut self, fit: Fit, block_size: usize) -> Result<usize, AllocError> {
        let Fit { rank, hole, offset } = fit;
        let block = hole.header + offset;
        let available = hole.size - offset;
        let rest = available - block_size;
        let (block_size, rest) = if rest < MIN_BLOCK_SIZE {
            (available, 0)
        } else {
            (block_size, rest)
        };

        let added = usize::from(offset > 0) + usize::from(rest > 0);
        ensure!(
            added <= 1 || !self.index.is_full(),
            AllocIndexFullSnafu { capacity: CAP }
        );

        let removed = self.index.remove(rank);
        debug_assert_eq!(removed, Some(hole));
        if offset > 0 {
            self.insert_hole(hole.header, offset);
        }
        // SAFETY: the block lies inside the hole just taken off the index
        unsafe {
            self.region.write_block(block, block_size, true);
        }
        if rest > 0 {
            self.insert_hole(block + block_size, rest);
        }
        Ok(block)
    }

    /// Payload capacity of the live allocation at `ptr`.
    ///
    /// This may exceed the size requested from [`allocate`](Self::allocate)
    /// because of rounding and absorbed remainders. Returns `None` if `ptr`
    /// is not the payload of an allocated block of this heap.
    #[must_use]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let block = self.region.block_of_payload(ptr.addr().get())?;
        // SAFETY: `block_of_payload` only returns addresses in the region
        let header = unsafe { self.region.read_block(block) }.ok()?;
        header
            .is_allocated()
            .then(|| header.size() - BLOCK_OVERHEAD)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::HEADER_SIZE,
        error::ResizeError,
        heap::tests::with_test_heap,
        page::is_page_aligned,
    };

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr.as_ptr().write_bytes(byte, len) };
    }

    fn assert_filled(ptr: NonNull<u8>, len: usize, byte: u8) {
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert!(bytes.iter().all(|&b| b == byte));
    }

    #[test]
    fn test_allocate_splits_hole() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let before = heap.stats();
            let ptr = heap.allocate(64, false).unwrap();
            assert_eq!(ptr.addr().get(), heap.start() + HEADER_SIZE);
            assert!(ptr.addr().get().is_multiple_of(BLOCK_ALIGN));

            let stats = heap.check().unwrap();
            assert_eq!(stats.hole_count, 1);
            assert_eq!(stats.free_bytes, before.free_bytes - (64 + BLOCK_OVERHEAD));
            assert_eq!(heap.usable_size(ptr), Some(64));
        });
    }

    #[test]
    fn test_allocate_rounds_to_block_granularity() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let a = heap.allocate(1, false).unwrap();
            let b = heap.allocate(17, false).unwrap();
            assert_eq!(heap.usable_size(a), Some(16));
            assert_eq!(heap.usable_size(b), Some(32));
            assert_eq!(b.addr().get() - a.addr().get(), 16 + BLOCK_OVERHEAD);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_zero_bytes() {
        with_test_heap(PAGE_SIZE, PAGE_SIZE, |heap| {
            let ptr = heap.allocate(0, false).unwrap();
            assert_eq!(heap.usable_size(ptr), Some(0));
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let sizes = [24, 100, 7, 512, 64];
            let ptrs: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    let ptr = heap.allocate(size, false).unwrap();
                    fill(ptr, size, i as u8 + 1);
                    ptr
                })
                .collect();
            heap.check().unwrap();
            for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
                assert_filled(ptr, size, i as u8 + 1);
            }
        });
    }

    #[test]
    fn test_allocate_absorbs_small_remainder() {
        with_test_heap(PAGE_SIZE, PAGE_SIZE, |heap| {
            // leaves 16 bytes, too few for a hole
            let size = PAGE_SIZE - BLOCK_OVERHEAD - 16;
            let ptr = heap.allocate(size, false).unwrap();
            assert_eq!(heap.usable_size(ptr), Some(size + 16));
            let stats = heap.check().unwrap();
            assert_eq!(stats.hole_count, 0);
            assert_eq!(stats.used_bytes, PAGE_SIZE);
        });
    }

    #[test]
    fn test_allocate_exact_fit() {
        with_test_heap(PAGE_SIZE, PAGE_SIZE, |heap| {
            let ptr = heap.allocate(PAGE_SIZE - BLOCK_OVERHEAD, false).unwrap();
            assert_eq!(heap.usable_size(ptr), Some(PAGE_SIZE - BLOCK_OVERHEAD));
            assert_eq!(heap.check().unwrap().hole_count, 0);
        });
    }

    #[test]
    fn test_allocate_page_aligned_keeps_leading_hole() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let ptr = heap.allocate(PAGE_SIZE, true).unwrap();
            assert!(is_page_aligned(ptr.addr().get()));
            fill(ptr, PAGE_SIZE, 0xa5);

            let blocks: Vec<_> = heap.blocks().map(Result::unwrap).collect();
            assert_eq!(blocks[0].address, heap.start());
            assert!(!blocks[0].allocated);
            assert_eq!(blocks[0].size, PAGE_SIZE - HEADER_SIZE);
            assert!(blocks[1].allocated);
            assert_eq!(blocks[1].address + HEADER_SIZE, ptr.addr().get());
            assert_eq!(heap.check().unwrap().hole_count, 2);
            assert_filled(ptr, PAGE_SIZE, 0xa5);
        });
    }

    #[test]
    fn test_allocate_page_aligned_without_prefix() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            // places the next hole's payload right on a page boundary
            heap.allocate(PAGE_SIZE - BLOCK_OVERHEAD - HEADER_SIZE, false)
                .unwrap();
            let holes_before = heap.stats().hole_count;
            let ptr = heap.allocate(64, true).unwrap();
            assert!(is_page_aligned(ptr.addr().get()));
            assert_eq!(heap.check().unwrap().hole_count, holes_before);
        });
    }

    #[test]
    fn test_allocate_page_aligned_skips_short_prefix() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            // the next hole starts 16 bytes short of the placement that
            // would page-align its payload
            heap.allocate(PAGE_SIZE - BLOCK_OVERHEAD - 2 * HEADER_SIZE, false)
                .unwrap();
            let ptr = heap.allocate(64, true).unwrap();
            assert_eq!(ptr.addr().get(), heap.start() + 2 * PAGE_SIZE);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_grows_heap() {
        with_test_heap(PAGE_SIZE, 16 * PAGE_SIZE, |heap| {
            let ptr = heap.allocate(2 * PAGE_SIZE, false).unwrap();
            assert!(heap.size() > PAGE_SIZE);
            assert!(ptr.addr().get() + 2 * PAGE_SIZE <= heap.end());
            fill(ptr, 2 * PAGE_SIZE, 0x5a);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_grows_for_page_aligned_block() {
        with_test_heap(PAGE_SIZE, 16 * PAGE_SIZE, |heap| {
            let ptr = heap.allocate(3 * PAGE_SIZE, true).unwrap();
            assert!(is_page_aligned(ptr.addr().get()));
            assert!(ptr.addr().get() + 3 * PAGE_SIZE <= heap.end());
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_out_of_memory() {
        with_test_heap(PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let end = heap.end();
            let err = heap.allocate(8 * PAGE_SIZE, false).unwrap_err();
            assert!(matches!(
                err,
                AllocError::OutOfMemory {
                    source: ResizeError::OutOfBounds { .. },
                    ..
                }
            ));
            assert_eq!(heap.end(), end);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_too_large() {
        with_test_heap(PAGE_SIZE, PAGE_SIZE, |heap| {
            let err = heap.allocate(usize::MAX - 8, false).unwrap_err();
            assert!(matches!(err, AllocError::TooLarge { .. }));
        });
    }

    #[test]
    fn test_allocate_uses_smallest_hole() {
        with_test_heap(4 * PAGE_SIZE, 4 * PAGE_SIZE, |heap| {
            let big = heap.allocate(512, false).unwrap();
            let _sep1 = heap.allocate(0, false).unwrap();
            let small = heap.allocate(128, false).unwrap();
            let _sep2 = heap.allocate(0, false).unwrap();
            unsafe {
                heap.free(big.as_ptr()).unwrap();
                heap.free(small.as_ptr()).unwrap();
            }
            let ptr = heap.allocate(100, false).unwrap();
            assert_eq!(ptr, small);
            let ptr = heap.allocate(300, false).unwrap();
            assert_eq!(ptr, big);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_allocate_index_full() {
        with_test_heap(8 * PAGE_SIZE, 8 * PAGE_SIZE, |heap| {
            // fill the index with holes separated by live blocks
            let mut ptrs = Vec::new();
            for _ in 0..heap.index_capacity() {
                ptrs.push(heap.allocate(64, false).unwrap());
                heap.allocate(0, false).unwrap();
            }
            for ptr in ptrs.iter().skip(1) {
                unsafe { heap.free(ptr.as_ptr()).unwrap() };
            }
            assert_eq!(heap.stats().hole_count, heap.index_capacity());

            // splitting a hole keeps the count, so this still works
            let ptr = heap.allocate(16, false).unwrap();
            assert!(heap.usable_size(ptr).is_some());
            // a page-aligned block out of the tail hole needs two new entries
            let blocks = heap.blocks().count();
            let err = heap.allocate(64, true).unwrap_err();
            assert!(matches!(err, AllocError::AllocIndexFull { .. }));
            assert_eq!(heap.blocks().count(), blocks);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_usable_size_rejects_foreign_pointers() {
        with_test_heap(PAGE_SIZE, PAGE_SIZE, |heap| {
            let ptr = heap.allocate(64, false).unwrap();
            let inside = NonNull::new(ptr.as_ptr().wrapping_add(16)).unwrap();
            assert_eq!(heap.usable_size(inside), None);
            let mut local = 0_u8;
            assert_eq!(heap.usable_size(NonNull::from(&mut local)), None);
            unsafe { heap.free(ptr.as_ptr()).unwrap() };
            assert_eq!(heap.usable_size(ptr), None);
        });
    }
}
