//! Page-size alignment arithmetic.
//!
//! All helpers use the power-of-two bitmask form `(n + p - 1) & !(p - 1)`, where `p`
//! is the platform page size reported by [`page_size`]. The `*_to` variants take an
//! explicit alignment and back the page-size helpers.

use crate::section;

/// Returns the granularity at which shared memory can be created and mapped on the
/// current platform: the regular page size on Unix (typically 4 KiB) and the
/// allocation granularity on Windows (64 KiB).
///
/// The value is queried once and cached.
#[inline]
pub fn page_size() -> usize {
    section::get_page_size()
}

/// Aligns a number up to the next multiple of the specified alignment.
///
/// # Panics
///
/// This function will panic in debug builds if `alignment` is 0 or not a power of 2.
#[inline]
pub fn align_up_to(n: usize, alignment: usize) -> usize {
    debug_assert_ne!(alignment, 0);
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}

/// Aligns a number up to the next multiple of `alignment`, or returns `None` if the
/// result doesn't fit in `usize`.
#[inline]
pub fn checked_align_up_to(n: usize, alignment: usize) -> Option<usize> {
    debug_assert!(alignment.is_power_of_two());
    Some(n.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Checks if a number is aligned to the specified alignment boundary.
///
/// # Panics
///
/// This function will panic in debug builds if `alignment` is 0 or not a power of 2.
#[inline]
pub fn is_aligned_to(n: usize, alignment: usize) -> bool {
    debug_assert_ne!(alignment, 0);
    debug_assert!(alignment.is_power_of_two());
    (n & (alignment - 1)) == 0
}

/// Rounds `size` up to the next multiple of the page size.
///
/// ```
/// use memalias_segment::align::{align_up, page_size};
///
/// let page = page_size();
/// assert_eq!(align_up(0), 0);
/// assert_eq!(align_up(1), page);
/// assert_eq!(align_up(page), page);
/// assert_eq!(align_up(page + 1), 2 * page);
/// ```
#[inline]
pub fn align_up(size: usize) -> usize {
    align_up_to(size, page_size())
}

/// Rounds `size` up to the next multiple of the page size, or returns `None` on
/// overflow.
#[inline]
pub fn checked_align_up(size: usize) -> Option<usize> {
    checked_align_up_to(size, page_size())
}

/// Rounds `size` up to the page size and adds `margin_pages` whole pages.
///
/// The margin gives a shared window room to start on a page boundary inside a
/// reservation whose own start is not page aligned.
#[inline]
pub fn align_up_with_margin(size: usize, margin_pages: usize) -> usize {
    align_up(size) + margin_pages * page_size()
}

/// Like [`align_up_with_margin`], but returns `None` on overflow.
#[inline]
pub fn checked_align_up_with_margin(size: usize, margin_pages: usize) -> Option<usize> {
    checked_align_up(size)?.checked_add(margin_pages.checked_mul(page_size())?)
}

/// Rounds a virtual address up to the next page boundary.
#[inline]
pub fn next_aligned_address(addr: usize) -> usize {
    align_up_to(addr, page_size())
}

/// Returns `true` if `addr` is a multiple of the page size.
#[inline]
pub fn is_aligned(addr: usize) -> bool {
    is_aligned_to(addr, page_size())
}
