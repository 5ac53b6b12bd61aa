//! In-place block metadata.
//!
//! Every block of the managed region, free or allocated, starts with a
//! [`BlockHeader`] and ends with a [`BlockFooter`]:
//!
//! ```text
//! ┌──────────────────────┬─────────────────────┬──────────────────────┐
//! │ BlockHeader          │ payload             │ BlockFooter          │
//! │ magic | state | size │                     │ magic | header addr  │
//! └──────────────────────┴─────────────────────┴──────────────────────┘
//! ^ header address                                         header + size ^
//! ```
//!
//! `size` spans the whole block including both tags. The footer points back
//! at its header so the block ending at a given address can be found by
//! reading the footer right before it, which is what coalescing relies on.
//! Both tags carry [`HEAP_MAGIC`]; a mismatch means the metadata was
//! overwritten.

/// Sentinel stored in every header and footer.
pub const HEAP_MAGIC: u32 = 0x1238_90ab;

/// Granularity of block addresses and sizes.
pub const BLOCK_ALIGN: usize = 16;

pub const HEADER_SIZE: usize = size_of::<BlockHeader>();
pub const FOOTER_SIZE: usize = size_of::<BlockFooter>();

/// Bytes of metadata every block carries.
pub const BLOCK_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Smallest block that can exist: tags around an empty payload.
pub const MIN_BLOCK_SIZE: usize = BLOCK_OVERHEAD;

const _: () = assert!(HEADER_SIZE == BLOCK_ALIGN && align_of::<BlockHeader>() == BLOCK_ALIGN);
const _: () = assert!(FOOTER_SIZE == BLOCK_ALIGN && align_of::<BlockFooter>() == BLOCK_ALIGN);

const STATE_FREE: u32 = 0;
const STATE_USED: u32 = 1;

/// Tag at the start of a block.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    magic: u32,
    state: u32,
    size: usize,
}

impl BlockHeader {
    #[must_use]
    pub const fn new(size: usize, allocated: bool) -> Self {
        Self {
            magic: HEAP_MAGIC,
            state: if allocated { STATE_USED } else { STATE_FREE },
            size,
        }
    }

    /// Returns `true` if the sentinel is intact and the state is one of the
    /// two known values.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == HEAP_MAGIC && (self.state == STATE_FREE || self.state == STATE_USED)
    }

    /// Total span of the block in bytes, tags included.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.state == STATE_USED
    }
}

/// Tag at the end of a block.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFooter {
    magic: u32,
    header: usize,
}

impl BlockFooter {
    #[must_use]
    pub const fn new(header: usize) -> Self {
        Self {
            magic: HEAP_MAGIC,
            header,
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == HEAP_MAGIC
    }

    /// Address of the header this footer belongs to.
    #[must_use]
    pub const fn header(&self) -> usize {
        self.header
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_sizes() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(FOOTER_SIZE, 16);
        assert_eq!(MIN_BLOCK_SIZE, 32);
    }

    #[test]
    fn test_header_state() {
        let used = BlockHeader::new(64, true);
        assert!(used.is_valid());
        assert!(used.is_allocated());
        assert_eq!(used.size(), 64);

        let free = BlockHeader::new(128, false);
        assert!(free.is_valid());
        assert!(!free.is_allocated());
    }

    #[test]
    fn test_header_rejects_bad_magic_and_state() {
        let mut header = BlockHeader::new(64, false);
        header.magic ^= 1;
        assert!(!header.is_valid());

        let mut header = BlockHeader::new(64, false);
        header.state = 7;
        assert!(!header.is_valid());
    }

    #[test]
    fn test_footer() {
        let footer = BlockFooter::new(0x4000);
        assert!(footer.is_valid());
        assert_eq!(footer.header(), 0x4000);

        let mut footer = footer;
        footer.magic = 0;
        assert!(!footer.is_valid());
    }
}
