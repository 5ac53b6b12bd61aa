//! A fixed-capacity collection kept in ascending order, placed in
//! caller-supplied memory.
//!
//! `SortedArray` is meant for allocators that must index their own free
//! space before any other allocator exists. The backing storage is a raw
//! memory region handed over by the caller (typically the first bytes of the
//! region the allocator manages), so creating the collection never allocates.
//!
//! # Features
//!
//! - **Sorted order**: Items are kept in ascending order according to their
//!   [`Ord`] implementation
//! - **Rank access**: Items are looked up and removed by their position in
//!   that order
//! - **No-std support**: Can be used in `no_std` environments
//! - **Fixed capacity**: Uses an `ArrayVec` written directly into the storage
//!
//! # Examples
//!
//! ```
//! use core::{mem::MaybeUninit, ptr::NonNull};
//!
//! use arrayvec::ArrayVec;
//! use sorted_array::SortedArray;
//!
//! let mut storage = MaybeUninit::<ArrayVec<u32, 8>>::uninit();
//! let mut array = unsafe { SortedArray::<u32, 8>::place(NonNull::from(&mut storage).cast()) };
//!
//! array.insert(30).unwrap();
//! array.insert(10).unwrap();
//! array.insert(20).unwrap();
//! assert_eq!(array.as_slice(), &[10, 20, 30]);
//!
//! assert_eq!(array.remove(1), Some(20));
//! assert_eq!(array.as_slice(), &[10, 30]);
//! ```
//!
//! # Performance
//!
//! - Insert: O(n) worst case (binary search plus shifting the tail)
//! - Remove: O(n) worst case
//! - Lookup by rank: O(1)
//! - Position of an item: O(log n)

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{alloc::Layout, fmt, ptr::NonNull, slice};

pub use arrayvec::CapacityError;
use arrayvec::ArrayVec;

/// A fixed-capacity collection of items stored in ascending order.
///
/// The collection does not own its storage: it refers to an `ArrayVec`
/// written into memory provided by [`place`](Self::place). The caller keeps
/// that memory alive and unaliased for as long as the collection is used.
pub struct SortedArray<T, const CAP: usize> {
    items: NonNull<ArrayVec<T, CAP>>,
}

unsafe impl<T, const CAP: usize> Send for SortedArray<T, CAP> where T: Send {}

impl<T, const CAP: usize> SortedArray<T, CAP> {
    /// Returns the size and alignment of the storage that
    /// [`place`](Self::place) requires.
    #[must_use]
    pub const fn storage_layout() -> Layout {
        Layout::new::<ArrayVec<T, CAP>>()
    }

    /// Creates an empty collection inside `storage`.
    ///
    /// # Panics
    ///
    /// Panics if `storage` is not aligned to
    /// [`storage_layout().align()`](Self::storage_layout).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `storage..storage + storage_layout().size()` is valid for reads and
    ///   writes
    /// - The memory is not used for anything else while the returned
    ///   collection (or any value moved out of it) is in use
    pub unsafe fn place(storage: NonNull<u8>) -> Self {
        let items = storage.cast::<ArrayVec<T, CAP>>();
        assert!(items.is_aligned(), "Storage must be properly aligned");
        unsafe {
            items.write(ArrayVec::new_const());
        }
        Self { items }
    }

    fn items(&self) -> &ArrayVec<T, CAP> {
        // SAFETY: `place` initialized the storage and the caller guarantees
        // exclusive access to it.
        unsafe { self.items.as_ref() }
    }

    fn items_mut(&mut self) -> &mut ArrayVec<T, CAP> {
        // SAFETY: same as `items`
        unsafe { self.items.as_mut() }
    }

    /// Returns the number of items in the collection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Returns `true` if the collection contains no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Returns `true` if no more items can be inserted.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items().is_full()
    }

    /// Returns the maximum number of items.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Returns the number of items that can still be inserted.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.items().remaining_capacity()
    }

    /// Returns a slice of all items in ascending order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        self.items().as_slice()
    }

    /// Returns an iterator over the items in ascending order.
    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.items().iter()
    }

    /// Returns the item at sorted position `rank`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use core::{mem::MaybeUninit, ptr::NonNull};
    /// # use arrayvec::ArrayVec;
    /// # use sorted_array::SortedArray;
    /// let mut storage = MaybeUninit::<ArrayVec<u32, 4>>::uninit();
    /// let mut array = unsafe { SortedArray::<u32, 4>::place(NonNull::from(&mut storage).cast()) };
    /// array.insert(7).unwrap();
    /// array.insert(3).unwrap();
    ///
    /// assert_eq!(array.lookup(0), Some(&3));
    /// assert_eq!(array.lookup(2), None);
    /// ```
    #[must_use]
    pub fn lookup(&self, rank: usize) -> Option<&T> {
        self.items().get(rank)
    }

    /// Removes and returns the item at sorted position `rank`.
    ///
    /// The remaining items keep their relative order. Returns `None` if
    /// `rank` is out of bounds.
    pub fn remove(&mut self, rank: usize) -> Option<T> {
        self.items_mut().pop_at(rank)
    }
}

impl<T, const CAP: usize> SortedArray<T, CAP>
where
    T: Ord,
{
    /// Inserts an item, keeping the collection in ascending order.
    ///
    /// Equal items are inserted after the existing ones. Returns the rank the
    /// item was stored at.
    ///
    /// # Errors
    ///
    /// Returns the item back inside a [`CapacityError`] if the collection is
    /// full.
    ///
    /// # Examples
    ///
    /// ```
    /// # use core::{mem::MaybeUninit, ptr::NonNull};
    /// # use arrayvec::ArrayVec;
    /// # use sorted_array::SortedArray;
    /// let mut storage = MaybeUninit::<ArrayVec<u32, 2>>::uninit();
    /// let mut array = unsafe { SortedArray::<u32, 2>::place(NonNull::from(&mut storage).cast()) };
    ///
    /// assert_eq!(array.insert(5), Ok(0));
    /// assert_eq!(array.insert(1), Ok(0));
    /// assert_eq!(array.insert(9).unwrap_err().element(), 9);
    /// ```
    pub fn insert(&mut self, item: T) -> Result<usize, CapacityError<T>> {
        let items = self.items_mut();
        let rank = items.partition_point(|x| *x <= item);
        items.try_insert(rank, item)?;
        Ok(rank)
    }

    /// Returns the rank of an item equal to `item`, if any.
    #[must_use]
    pub fn position(&self, item: &T) -> Option<usize> {
        self.items().binary_search(item).ok()
    }

    /// Removes an item equal to `item` and returns it.
    pub fn remove_item(&mut self, item: &T) -> Option<T> {
        let rank = self.position(item)?;
        self.remove(rank)
    }
}

impl<T, const CAP: usize> fmt::Debug for SortedArray<T, CAP>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, T, const CAP: usize> IntoIterator for &'a SortedArray<T, CAP> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
