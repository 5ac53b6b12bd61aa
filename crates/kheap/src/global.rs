//! Registration of a heap as the global allocator.
//!
//! ```rust,ignore
//! use kheap::LockedHeap;
//!
//! #[global_allocator]
//! static HEAP: LockedHeap = LockedHeap::empty();
//!
//! unsafe { HEAP.init(heap_start, heap_end, heap_max) };
//! ```

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::{Mutex, MutexGuard};

use crate::{
    block::BLOCK_ALIGN,
    heap::{DEFAULT_INDEX_CAPACITY, Heap},
    page::PAGE_SIZE,
};

/// A [`Heap`] behind a spin lock, usable as `#[global_allocator]`.
///
/// Allocations fail with null until [`init`](Self::init) is called.
pub struct LockedHeap<const CAP: usize = DEFAULT_INDEX_CAPACITY> {
    heap: Mutex<Option<Heap<CAP>>>,
}

impl<const CAP: usize> LockedHeap<CAP> {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Creates the heap, see [`Heap::create`].
    ///
    /// # Panics
    ///
    /// Panics if the heap was already initialized or if [`Heap::create`]
    /// panics.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::create`].
    pub unsafe fn init(&self, heap_start: *mut u8, heap_end: *mut u8, heap_max: *mut u8) {
        let mut heap = self.heap.lock();
        assert!(heap.is_none(), "heap already initialized");
        *heap = Some(unsafe { Heap::create(heap_start, heap_end, heap_max) });
    }

    /// Locks the heap for direct use.
    pub fn lock(&self) -> MutexGuard<'_, Option<Heap<CAP>>> {
        self.heap.lock()
    }
}

impl<const CAP: usize> Default for LockedHeap<CAP> {
    fn default() -> Self {
        Self::empty()
    }
}

unsafe impl<const CAP: usize> GlobalAlloc for LockedHeap<CAP> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let page_align = match layout.align() {
            align if align <= BLOCK_ALIGN => false,
            align if align <= PAGE_SIZE => true,
            _ => return ptr::null_mut(),
        };
        let mut heap = self.heap.lock();
        let Some(heap) = heap.as_mut() else {
            return ptr::null_mut();
        };
        match heap.allocate(layout.size(), page_align) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                log::debug!("allocation of {layout:?} failed: {err}");
                ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let result = {
            let mut heap = self.heap.lock();
            match heap.as_mut() {
                Some(heap) => unsafe { heap.free(ptr) },
                None => Ok(()),
            }
        };
        // the lock is released so reporting may allocate
        if let Err(err) = result {
            snafu_utils::report(err);
        }
    }
}
