//! Test support for memalias: a synthetic guest that speaks the reservation and
//! acknowledgment protocol without a WebAssembly runtime.

pub mod heap_guest;

pub use heap_guest::HeapGuest;

/// Fills `buf` with a position-dependent byte pattern, so misplaced copies show up.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8;
    }
}
