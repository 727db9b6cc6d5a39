use std::sync::OnceLock;

/// Handle of an anonymous shared memory object (a memfd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHandle(libc::c_int);

/// Creates an anonymous, shareable memory object of exactly `size` bytes.
///
/// The object is a memfd sized with `ftruncate`; it can be mapped any number of
/// times with [`map_view`], and every mapping refers to the same physical pages.
///
/// # Arguments
///
/// * `size` - Size of the object in bytes. Must be a non-zero multiple of
///   [`get_page_size`].
///
/// # Returns
///
/// Returns the handle of the new object, or an `io::Error` if `size` is invalid
/// or one of the underlying system calls fails.
pub fn create_section(size: usize) -> std::io::Result<SectionHandle> {
    if size == 0 || !size.is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "section size must be a non-zero multiple of the page size",
        ));
    }
    let fd = unsafe { libc::memfd_create(c"memalias".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let res = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(SectionHandle(fd))
}

/// Releases a memory object created by [`create_section`].
///
/// Existing mappings stay valid: the kernel keeps the pages alive until the last
/// mapping is removed.
///
/// # Safety
///
/// `handle` must have been returned by [`create_section`] and must not be used
/// after this call.
pub unsafe fn close_section(handle: SectionHandle) -> std::io::Result<()> {
    let res = unsafe { libc::close(handle.0) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Maps `size` bytes of the memory object into the address space.
///
/// # Arguments
///
/// * `handle` - The memory object to map.
/// * `size` - Length of the mapping in bytes.
/// * `address` - Exact placement of the mapping, or 0 to let the kernel choose.
///   A non-zero address must be page aligned and the range must be free: an
///   occupied range fails with `EEXIST` instead of replacing what is there.
/// * `writable` - Whether the mapping is writable. Read-only mappings fault on write.
///
/// # Returns
///
/// The base address of the new mapping.
pub fn map_view(
    handle: SectionHandle,
    size: usize,
    address: usize,
    writable: bool,
) -> std::io::Result<usize> {
    if !address.is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mapping address must be page aligned",
        ));
    }
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let mut flags = libc::MAP_SHARED;
    if address != 0 {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }
    let ptr = unsafe { libc::mmap(address as *mut libc::c_void, size, prot, flags, handle.0, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    // Kernels older than 4.17 treat MAP_FIXED_NOREPLACE as a plain hint.
    if address != 0 && ptr as usize != address {
        unsafe { libc::munmap(ptr, size) };
        return Err(std::io::Error::from_raw_os_error(libc::EEXIST));
    }
    Ok(ptr as usize)
}

/// Removes a mapping created by [`map_view`].
///
/// # Safety
///
/// `address` and `size` must describe a live mapping returned by [`map_view`],
/// and no references into it may outlive this call.
pub unsafe fn unmap_view(address: usize, size: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munmap(address as *mut libc::c_void, size) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Gets the system's standard page size in bytes.
///
/// The value is cached after the first call. If `sysconf(_SC_PAGESIZE)` fails,
/// 4 KiB is assumed.
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| read_page_size().unwrap_or(4 * 1024))
}

fn read_page_size() -> std::io::Result<usize> {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    assert!(res < i32::MAX as _);
    Ok(res as usize)
}
