//! Targets without a mappable shared memory facility. Aliasing cannot be emulated
//! with private allocations, so every operation reports `Unsupported`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHandle(());

fn unsupported() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "shared memory sections are not supported on this platform",
    )
}

pub fn create_section(_size: usize) -> std::io::Result<SectionHandle> {
    Err(unsupported())
}

pub unsafe fn close_section(_handle: SectionHandle) -> std::io::Result<()> {
    Err(unsupported())
}

pub fn map_view(
    _handle: SectionHandle,
    _size: usize,
    _address: usize,
    _writable: bool,
) -> std::io::Result<usize> {
    Err(unsupported())
}

pub unsafe fn unmap_view(_address: usize, _size: usize) -> std::io::Result<()> {
    Err(unsupported())
}

/// Returns the "standard page" size in bytes.
pub fn get_page_size() -> usize {
    4 * 1024
}
