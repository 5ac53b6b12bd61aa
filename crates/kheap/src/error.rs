use core::fmt;

use snafu::Snafu;
use snafu_utils::{ErrorLocation, Location};

/// What was wrong with a block's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The header sentinel or state field was overwritten.
    HeaderMagic,
    /// The footer sentinel was overwritten.
    FooterMagic,
    /// The footer does not point back at the header.
    FooterMismatch,
    /// The size is misaligned, too small, or runs past the heap end.
    BadSize,
    /// The block before this one does not end where this one starts.
    NeighborMismatch,
    /// A free block is missing from the hole index.
    Unindexed,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::HeaderMagic => "bad header sentinel",
            Self::FooterMagic => "bad footer sentinel",
            Self::FooterMismatch => "footer does not refer to its header",
            Self::BadSize => "block size out of range",
            Self::NeighborMismatch => "neighbouring blocks do not meet",
            Self::Unindexed => "free block missing from the hole index",
        };
        f.write_str(msg)
    }
}

/// Metadata of the block at `address` cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
#[snafu(display("{kind} at {address:#x}"))]
#[snafu(visibility(pub(crate)))]
pub struct CorruptBlock {
    pub address: usize,
    pub kind: Corruption,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResizeError {
    #[snafu(display("heap end {requested_end:#x} would exceed limit {max:#x}"))]
    OutOfBounds {
        requested_end: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot shrink heap to {new_end:#x}: trailing memory is in use"))]
    InUse {
        new_end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no room in the hole index for the grown tail ({capacity} entries)"))]
    ResizeIndexFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap metadata corrupted: {source}"))]
    ResizeCorrupt {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: CorruptBlock,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("cannot grow heap for a {size:#x} byte block"))]
    OutOfMemory {
        size: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: ResizeError,
    },
    #[snafu(display("allocation of {size:#x} bytes overflows the address space"))]
    TooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no room in the hole index to split a hole ({capacity} entries)"))]
    AllocIndexFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FreeError {
    #[snafu(display("heap corrupted: {source}"))]
    CorruptHeap {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: CorruptBlock,
    },
    #[snafu(display("pointer {address:#x} does not belong to this heap"))]
    InvalidPointer {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("double free of {address:#x}"))]
    DoubleFree {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no room in the hole index for the freed block ({capacity} entries)"))]
    FreeIndexFull {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// An invariant of the heap does not hold.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CheckError {
    #[snafu(display("block walk failed: {source}"))]
    Corrupt {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: CorruptBlock,
    },
    #[snafu(display("free block {address:#x} is not in the hole index"))]
    NotIndexed {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("hole index has {indexed} entries but the heap has {free} free blocks"))]
    IndexMismatch {
        indexed: usize,
        free: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free blocks at {address:#x} and the one before it are adjacent"))]
    AdjacentHoles {
        address: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("hole index is not sorted by size"))]
    Unordered {
        #[snafu(implicit)]
        location: Location,
    },
}

impl ErrorLocation for CorruptBlock {
    fn location(&self) -> Option<Location> {
        None
    }
}

impl ErrorLocation for ResizeError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::OutOfBounds { location, .. }
            | Self::InUse { location, .. }
            | Self::ResizeIndexFull { location, .. }
            | Self::ResizeCorrupt { location, .. } => Some(*location),
        }
    }

    fn located_source(&self) -> Option<&dyn ErrorLocation> {
        match self {
            Self::ResizeCorrupt { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ErrorLocation for AllocError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::TooLarge { location, .. }
            | Self::AllocIndexFull { location, .. } => Some(*location),
        }
    }

    fn located_source(&self) -> Option<&dyn ErrorLocation> {
        match self {
            Self::OutOfMemory { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ErrorLocation for FreeError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::CorruptHeap { location, .. }
            | Self::InvalidPointer { location, .. }
            | Self::DoubleFree { location, .. }
            | Self::FreeIndexFull { location, .. } => Some(*location),
        }
    }

    fn located_source(&self) -> Option<&dyn ErrorLocation> {
        match self {
            Self::CorruptHeap { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ErrorLocation for CheckError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::Corrupt { location, .. }
            | Self::NotIndexed { location, .. }
            | Self::IndexMismatch { location, .. }
            | Self::AdjacentHoles { location, .. }
            | Self::Unordered { location } => Some(*location),
        }
    }

    fn located_source(&self) -> Option<&dyn ErrorLocation> {
        match self {
            Self::Corrupt { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use snafu_utils::Report;

    use super::*;
    use crate::{heap::tests::with_test_heap, page::PAGE_SIZE};

    #[test]
    fn test_report_shows_locations_of_chain() {
        with_test_heap(PAGE_SIZE, 2 * PAGE_SIZE, |heap| {
            let err = heap.allocate(4 * PAGE_SIZE, false).unwrap_err();
            let (location, inner) = match &err {
                AllocError::OutOfMemory {
                    location, source, ..
                } => (*location, source.location().unwrap()),
                err => panic!("expected out of memory, got {err:?}"),
            };
            assert!(location.file().ends_with("allocate.rs"));
            assert!(inner.file().ends_with("mod.rs"));

            let rendered = Report::new(err).to_string();
            assert!(rendered.contains(&format!("\n  at {location}\n")));
            assert!(rendered.contains(&format!("\n      at {inner}\n")));
        });
    }

    #[test]
    fn test_corrupt_block_has_no_location() {
        let err = CorruptBlock {
            address: 0x1000,
            kind: Corruption::BadSize,
        };
        assert_eq!(err.location(), None);
        assert_eq!(
            Report::new(err).to_string(),
            "Error: block size out of range at 0x1000\n"
        );
    }
}
