use std::{
    ffi::CString,
    sync::{
        OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Handle of a POSIX shared memory object whose name has already been unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHandle(libc::c_int);

/// Creates an anonymous, shareable memory object of exactly `size` bytes.
///
/// The object is opened with `shm_open` under a process-unique name which is
/// unlinked immediately, so only the returned descriptor refers to it.
pub fn create_section(size: usize) -> std::io::Result<SectionHandle> {
    if size == 0 || !size.is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "section size must be a non-zero multiple of the page size",
        ));
    }

    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/memalias.{}.{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let fd = unsafe { open_shm(&name) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe { unlink_or_close(fd, &name)? };

    let res = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(SectionHandle(fd))
}

/// Removes the name of a freshly opened object. On failure `fd` is closed, so the
/// caller must not use it again.
unsafe fn unlink_or_close(fd: libc::c_int, name: &CString) -> std::io::Result<()> {
    let res = unsafe { libc::shm_unlink(name.as_ptr()) };
    if res < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(())
}

#[cfg(target_vendor = "apple")]
unsafe fn open_shm(name: &CString) -> libc::c_int {
    unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        )
    }
}

#[cfg(not(target_vendor = "apple"))]
unsafe fn open_shm(name: &CString) -> libc::c_int {
    unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    }
}

/// Releases a memory object created by [`create_section`].
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
/// A non-zero `address` is passed as a placement hint without `MAP_FIXED`, so an
/// occupied range is never replaced. If the kernel places the mapping elsewhere,
/// the mapping is removed again and `EEXIST` is reported.
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
    let ptr = unsafe {
        libc::mmap(
            address as *mut libc::c_void,
            size,
            prot,
            libc::MAP_SHARED,
            handle.0,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
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

/// Gets the system's standard page size in bytes, cached after the first call.
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if res > 0 { res as usize } else { 4 * 1024 }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_unlink_closes_descriptor() {
        let fd = unsafe { libc::dup(0) };
        assert!(fd >= 0);
        let name = CString::new("/memalias.never-created").unwrap();
        let err = unsafe { unlink_or_close(fd, &name) }.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
    }

    #[test]
    fn test_create_map_and_release_section() {
        let size = get_page_size();
        let handle = create_section(size).unwrap();
        let address = map_view(handle, size, 0, true).unwrap();
        unsafe {
            unmap_view(address, size).unwrap();
            close_section(handle).unwrap();
        }
    }
}
