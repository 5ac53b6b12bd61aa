//! A kernel heap over one contiguous, growable memory region.
//!
//! Every block carries a header and a footer ([`block`]), so a block's
//! neighbours can be found in both directions and adjacent free blocks are
//! merged as soon as one of them is freed. Free blocks ("holes") are kept in
//! a fixed-capacity index ordered by size that lives at the front of the
//! region, and each request is served from the smallest hole that fits. When
//! no hole fits, the heap grows towards a fixed limit.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kheap::Heap;
//!
//! let mut heap: Heap = unsafe { Heap::create(heap_start, heap_end, heap_max) };
//!
//! let ptr = heap.allocate(64, false)?;
//! let page = heap.allocate(4096, true)?;
//! assert!(kheap::page::is_page_aligned(page.addr().get()));
//!
//! unsafe {
//!     heap.free(ptr.as_ptr())?;
//!     heap.free(page.as_ptr())?;
//! }
//! heap.trim(0)?;
//! ```
//!
//! [`LockedHeap`] wraps a heap in a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! # Thread Safety
//!
//! [`Heap`] takes `&mut self` for every change and is `Send` but not `Sync`.
//! Callers sharing one heap serialize access themselves, for example through
//! [`LockedHeap`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod block;
pub mod error;
mod global;
mod heap;
pub mod page;
mod region;

pub use self::{
    global::LockedHeap,
    heap::{DEFAULT_INDEX_CAPACITY, Heap, HeapStats, Hole},
    region::{BlockInfo, Blocks},
};
