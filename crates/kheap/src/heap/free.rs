use snafu::{OptionExt as _, ResultExt as _, ensure};

use super::{Heap, Hole};
use crate::{
    block::BlockHeader,
    error::{
        CorruptBlockSnafu, CorruptHeapSnafu, Corruption, DoubleFreeSnafu, FreeError,
        FreeIndexFullSnafu, InvalidPointerSnafu,
    },
};

impl<const CAP: usize> Heap<CAP> {
    /// Returns the block whose payload starts at `ptr` to the heap.
    ///
    /// The block is merged with a free block right before and right after
    /// it, and the result is registered as a single hole. A null `ptr` is
    /// ignored.
    ///
    /// # Errors
    ///
    /// - [`FreeError::InvalidPointer`] if `ptr` cannot be a payload of this
    ///   heap
    /// - [`FreeError::DoubleFree`] if the block is already free
    /// - [`FreeError::CorruptHeap`] if the metadata of the block or of a
    ///   neighbour does not validate
    /// - [`FreeError::FreeIndexFull`] if the block needs a new index entry
    ///   and none is left
    ///
    /// Everything is validated before the first write, so the heap is left
    /// unchanged on error.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by
    /// [`allocate`](Self::allocate) on this heap that is not used afterwards.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), FreeError> {
        if ptr.is_null() {
            return Ok(());
        }
        let address = ptr.addr();
        let block = self
            .region
            .block_of_payload(address)
            .context(InvalidPointerSnafu { address })?;

        let result = self.release(block);
        match &result {
            Err(err @ FreeError::CorruptHeap { .. }) => log::error!("free({address:#x}): {err}"),
            Err(err @ FreeError::DoubleFree { .. }) => log::warn!("free({address:#x}): {err}"),
            _ => {}
        }
        result
    }

    fn release(&mut self, block: usize) -> Result<(), FreeError> {
        // SAFETY: `block` lies in the region and the region is valid memory
        let header = unsafe { self.region.read_block(block) }.context(CorruptHeapSnafu)?;
        ensure!(header.is_allocated(), DoubleFreeSnafu { address: block });
        let size = header.size();

        // SAFETY: `block` is a validated block of the region
        let (prev, next) = unsafe {
            (
                self.region.block_before(block),
                self.region.block_after(block, size),
            )
        };
        let prev = self.free_neighbor(prev.context(CorruptHeapSnafu)?)?;
        let next = self.free_neighbor(next.context(CorruptHeapSnafu)?)?;
        ensure!(
            prev.is_some() || next.is_some() || !self.index.is_full(),
            FreeIndexFullSnafu { capacity: CAP }
        );

        // SAFETY: validated above
        unsafe {
            self.region.set_allocated(block, false);
        }
        let mut start = block;
        let mut end = block + size;
        if let Some(hole) = prev {
            self.remove_hole(hole.header, hole.size);
            start = hole.header;
        }
        if let Some(hole) = next {
            self.remove_hole(hole.header, hole.size);
            end = hole.header + hole.size;
        }
        self.insert_hole(start, end - start);
        log::trace!("freed block {block:#x}, hole {start:#x}..{end:#x}");
        Ok(())
    }

    /// Keeps `neighbor` if it is free, after making sure the index knows it.
    fn free_neighbor(
        &self,
        neighbor: Option<(usize, BlockHeader)>,
    ) -> Result<Option<Hole>, FreeError> {
        let Some((address, header)) = neighbor else {
            return Ok(None);
        };
        if header.is_allocated() {
            return Ok(None);
        }
        let hole = Hole {
            size: header.size(),
            header: address,
        };
        if self.index.position(&hole).is_none() {
            return CorruptBlockSnafu {
                address,
                kind: Corruption::Unindexed,
            }
            .fail()
            .context(CorruptHeapSnafu);
        }
        Ok(Some(hole))
    }
}
