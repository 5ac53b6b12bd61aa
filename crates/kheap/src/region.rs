//! Typed access to the block metadata embedded in the managed region.
//!
//! [`Region`] owns the address arithmetic of the heap. It knows the current
//! bounds `[start, end)` and a base pointer whose provenance covers the whole
//! area the heap may ever grow into, and turns block addresses into header
//! and footer accesses. Every read validates what it finds against the
//! bounds before following a size or back-reference, so corrupted metadata is
//! reported as a [`CorruptBlock`] instead of steering a read outside the
//! heap.

use core::{fmt, ptr::NonNull};

use crate::{
    block::{
        BLOCK_ALIGN, BlockFooter, BlockHeader, FOOTER_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE,
    },
    error::{CorruptBlock, CorruptBlockSnafu, Corruption},
};

/// One block of the heap as seen while walking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub address: usize,
    /// Total span of the block, tags included.
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Number of payload bytes between the tags.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.size - HEADER_SIZE - FOOTER_SIZE
    }
}

pub(crate) struct Region {
    base: NonNull<u8>,
    start: usize,
    end: usize,
}

impl Region {
    /// Creates a handle for the blocks in `start..end`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes from `start` up to the
    /// furthest address `end` will ever be moved to, and `start` must not be
    /// below `base`.
    pub(crate) unsafe fn new(base: NonNull<u8>, start: usize, end: usize) -> Self {
        assert!(base.addr().get() <= start && start <= end);
        assert!(start.is_multiple_of(BLOCK_ALIGN) && end.is_multiple_of(BLOCK_ALIGN));
        Self { base, start, end }
    }

    pub(crate) fn start(&self) -> usize {
        self.start
    }

    pub(crate) fn end(&self) -> usize {
        self.end
    }

    /// Moves the upper bound.
    ///
    /// The caller is responsible for keeping the blocks a partition of the
    /// new bounds.
    pub(crate) fn set_end(&mut self, end: usize) {
        assert!(self.start <= end && end.is_multiple_of(BLOCK_ALIGN));
        self.end = end;
    }

    fn ptr_at<T>(&self, addr: usize) -> NonNull<T> {
        let offset = addr - self.base.addr().get();
        // SAFETY: every address handed in lies between `base` and the
        // furthest end the region may reach (safety contract of `new`).
        unsafe { self.base.byte_add(offset).cast() }
    }

    /// Returns the payload pointer of the block at `addr`.
    pub(crate) fn payload(&self, addr: usize) -> NonNull<u8> {
        self.ptr_at(addr + HEADER_SIZE)
    }

    /// Maps a payload pointer back to the address of its block.
    ///
    /// Returns `None` if no block of the region could have handed it out.
    pub(crate) fn block_of_payload(&self, payload: usize) -> Option<usize> {
        let addr = payload.checked_sub(HEADER_SIZE)?;
        let fits = addr >= self.start
            && addr.is_multiple_of(BLOCK_ALIGN)
            && addr
                .checked_add(MIN_BLOCK_SIZE)
                .is_some_and(|block_end| block_end <= self.end);
        fits.then_some(addr)
    }

    /// Writes the header and footer of a block spanning `addr..addr + size`.
    ///
    /// # Safety
    ///
    /// The span must lie inside the region and must not overlap a block that
    /// is still referenced elsewhere.
    pub(crate) unsafe fn write_block(&self, addr: usize, size: usize, allocated: bool) {
        assert!(size >= MIN_BLOCK_SIZE && size.is_multiple_of(BLOCK_ALIGN));
        assert!(addr >= self.start && addr + size <= self.end);
        unsafe {
            self.ptr_at::<BlockHeader>(addr)
                .write(BlockHeader::new(size, allocated));
            self.ptr_at::<BlockFooter>(addr + size - FOOTER_SIZE)
                .write(BlockFooter::new(addr));
        }
    }

    /// Rewrites only the state of the header at `addr`.
    ///
    /// # Safety
    ///
    /// A valid block must start at `addr`.
    pub(crate) unsafe fn set_allocated(&self, addr: usize, allocated: bool) {
        unsafe {
            let header = self.ptr_at::<BlockHeader>(addr);
            let size = header.read().size();
            header.write(BlockHeader::new(size, allocated));
        }
    }

    /// Reads and validates the block at `addr`.
    ///
    /// Checks both sentinels, that the size is sane and stays in bounds, and
    /// that the footer points back at `addr`.
    ///
    /// # Safety
    ///
    /// The region's memory must be readable (the contract of `new`). The
    /// contents may be anything.
    pub(crate) unsafe fn read_block(&self, addr: usize) -> Result<BlockHeader, CorruptBlock> {
        let fail = |kind: Corruption| CorruptBlockSnafu { address: addr, kind }.fail();

        if addr < self.start
            || !addr.is_multiple_of(BLOCK_ALIGN)
            || addr.checked_add(MIN_BLOCK_SIZE).is_none_or(|end| end > self.end)
        {
            return fail(Corruption::BadSize);
        }
        let header = unsafe { self.ptr_at::<BlockHeader>(addr).read() };
        if !header.is_valid() {
            return fail(Corruption::HeaderMagic);
        }
        let size = header.size();
        if size < MIN_BLOCK_SIZE
            || !size.is_multiple_of(BLOCK_ALIGN)
            || size > self.end - addr
        {
            return fail(Corruption::BadSize);
        }
        let footer = unsafe { self.ptr_at::<BlockFooter>(addr + size - FOOTER_SIZE).read() };
        if !footer.is_valid() {
            return fail(Corruption::FooterMagic);
        }
        if footer.header() != addr {
            return fail(Corruption::FooterMismatch);
        }
        Ok(header)
    }

    /// Finds the block that ends right where the block at `addr` starts.
    ///
    /// Returns `None` for the first block of the region.
    ///
    /// # Safety
    ///
    /// Same as [`read_block`](Self::read_block). `addr` must be a block
    /// boundary inside `start..=end`.
    pub(crate) unsafe fn block_before(
        &self,
        addr: usize,
    ) -> Result<Option<(usize, BlockHeader)>, CorruptBlock> {
        if addr <= self.start {
            return Ok(None);
        }
        let footer_addr = addr - FOOTER_SIZE;
        let footer = unsafe { self.ptr_at::<BlockFooter>(footer_addr).read() };
        if !footer.is_valid() {
            return CorruptBlockSnafu {
                address: footer_addr,
                kind: Corruption::FooterMagic,
            }
            .fail();
        }
        let prev = footer.header();
        if prev < self.start || prev >= addr {
            return CorruptBlockSnafu {
                address: footer_addr,
                kind: Corruption::FooterMismatch,
            }
            .fail();
        }
        let header = unsafe { self.read_block(prev)? };
        if prev + header.size() != addr {
            return CorruptBlockSnafu {
                address: prev,
                kind: Corruption::NeighborMismatch,
            }
            .fail();
        }
        Ok(Some((prev, header)))
    }

    /// Finds the block that starts right after the block at `addr` of `size`
    /// bytes.
    ///
    /// Returns `None` for the last block of the region.
    ///
    /// # Safety
    ///
    /// Same as [`read_block`](Self::read_block).
    pub(crate) unsafe fn block_after(
        &self,
        addr: usize,
        size: usize,
    ) -> Result<Option<(usize, BlockHeader)>, CorruptBlock> {
        let next = addr + size;
        if next >= self.end {
            return Ok(None);
        }
        let header = unsafe { self.read_block(next)? };
        Ok(Some((next, header)))
    }

    /// Walks the blocks in address order.
    ///
    /// # Safety
    ///
    /// Same as [`read_block`](Self::read_block).
    pub(crate) unsafe fn blocks(&self) -> Blocks<'_> {
        Blocks {
            region: self,
            next: self.start,
            failed: false,
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .finish_non_exhaustive()
    }
}

/// Iterator over the blocks of a heap in address order.
///
/// Yields an error and stops at the first block whose metadata does not
/// validate.
pub struct Blocks<'a> {
    region: &'a Region,
    next: usize,
    failed: bool,
}

impl Iterator for Blocks<'_> {
    type Item = Result<BlockInfo, CorruptBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.region.end {
            return None;
        }
        let address = self.next;
        // SAFETY: `Blocks` is only created through `Region::blocks`
        match unsafe { self.region.read_block(address) } {
            Ok(header) => {
                self.next += header.size();
                Some(Ok(BlockInfo {
                    address,
                    size: header.size(),
                    allocated: header.is_allocated(),
                }))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
