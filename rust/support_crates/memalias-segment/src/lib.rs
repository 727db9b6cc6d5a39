//! Page-aligned shared memory segments whose backing can be mapped at several
//! addresses at once.

pub mod align;
mod backing;
pub mod segment;

#[cfg_attr(target_os = "linux", path = "section_linux.rs")]
#[cfg_attr(windows, path = "section_win.rs")]
#[cfg_attr(
    all(unix, not(any(target_os = "linux", target_os = "android"))),
    path = "section_unix.rs"
)]
#[cfg_attr(
    not(any(target_os = "linux", windows, all(unix, not(target_os = "android")))),
    path = "section_fallback.rs"
)]
pub mod section;

pub use segment::{MemorySegment, View};
