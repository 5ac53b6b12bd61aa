//! Page geometry and address rounding.

/// Number of address bits covered by one page.
pub const PAGE_SHIFT: usize = 12;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Rounds `addr` down to the start of its page.
#[must_use]
pub const fn page_round_down(addr: usize) -> usize {
    addr & PAGE_MASK
}

/// Rounds `addr` up to the next page boundary.
///
/// Returns `addr` itself if it is already page-aligned, and `None` if the
/// rounded value does not fit in `usize`.
#[must_use]
pub const fn page_round_up(addr: usize) -> Option<usize> {
    align_up(addr, PAGE_SIZE)
}

/// Returns `true` if `addr` is a multiple of [`PAGE_SIZE`].
#[must_use]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & !PAGE_MASK == 0
}

/// Rounds `value` up to a multiple of `align`.
///
/// # Panics
///
/// Panics if `align` is not a power of two.
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    assert!(align.is_power_of_two(), "Alignment must be a power of two");
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round_down() {
        assert_eq!(page_round_down(0), 0);
        assert_eq!(page_round_down(0x1000), 0x1000);
        assert_eq!(page_round_down(0x1fff), 0x1000);
    }

    #[test]
    fn test_page_round_up() {
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(0x1000), Some(0x1000));
        assert_eq!(page_round_up(0x1001), Some(0x2000));
        assert_eq!(page_round_up(usize::MAX), None);
    }

    #[test]
    fn test_is_page_aligned() {
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3010));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(48, 16), Some(48));
        assert_eq!(align_up(usize::MAX - 3, 16), None);
    }

    #[test]
    #[should_panic(expected = "Alignment must be a power of two")]
    fn test_align_up_rejects_non_power_of_two() {
        let _ = align_up(10, 12);
    }
}
