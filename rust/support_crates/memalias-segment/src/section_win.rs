use std::sync::OnceLock;
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE},
    System::{
        Memory::{
            CreateFileMappingW, FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS,
            MapViewOfFileEx, PAGE_READWRITE, UnmapViewOfFile,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    },
};

/// Handle of a section object backed by the system paging file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHandle(usize);

impl SectionHandle {
    fn raw(self) -> HANDLE {
        self.0 as HANDLE
    }
}

/// Creates an anonymous, shareable section of exactly `size` bytes.
///
/// The section is a file mapping over the paging file (`INVALID_HANDLE_VALUE`),
/// which can be mapped any number of times with [`map_view`].
///
/// # Arguments
///
/// * `size` - Size of the section in bytes. Must be a non-zero multiple of
///   [`get_page_size`] (the allocation granularity).
pub fn create_section(size: usize) -> std::io::Result<SectionHandle> {
    if size == 0 || !size.is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "section size must be a non-zero multiple of the allocation granularity",
        ));
    }
    let size = size as u64;
    unsafe {
        let handle = CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            std::ptr::null(),
            PAGE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            std::ptr::null(),
        );
        if handle.is_null() {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
        Ok(SectionHandle(handle as usize))
    }
}

/// Closes a section created by [`create_section`].
///
/// Mapped views keep the section contents alive until they are unmapped.
///
/// # Safety
///
/// `handle` must have been returned by [`create_section`] and must not be used
/// after this call.
pub unsafe fn close_section(handle: SectionHandle) -> std::io::Result<()> {
    unsafe {
        if CloseHandle(handle.raw()) == 0 {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
    }
    Ok(())
}

/// Maps `size` bytes of the section into the address space.
///
/// # Arguments
///
/// * `handle` - The section to map.
/// * `size` - Length of the view in bytes.
/// * `address` - Exact placement of the view, or 0 to let the system choose. A
///   non-zero address must be aligned to the allocation granularity and the range
///   must be free.
/// * `writable` - Whether the view is writable. Read-only views fault on write.
pub fn map_view(
    handle: SectionHandle,
    size: usize,
    address: usize,
    writable: bool,
) -> std::io::Result<usize> {
    if !address.is_multiple_of(get_page_size()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mapping address must be aligned to the allocation granularity",
        ));
    }
    let access = if writable {
        FILE_MAP_READ | FILE_MAP_WRITE
    } else {
        FILE_MAP_READ
    };
    unsafe {
        let view = MapViewOfFileEx(
            handle.raw(),
            access,
            0,
            0,
            size,
            address as *const std::ffi::c_void,
        );
        if view.Value.is_null() {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
        Ok(view.Value as usize)
    }
}

/// Unmaps a view created by [`map_view`].
///
/// # Safety
///
/// `address` must be the base of a live view returned by [`map_view`], and no
/// references into it may outlive this call.
pub unsafe fn unmap_view(address: usize, _size: usize) -> std::io::Result<()> {
    unsafe {
        let view = MEMORY_MAPPED_VIEW_ADDRESS {
            Value: address as *mut std::ffi::c_void,
        };
        if UnmapViewOfFile(view) == 0 {
            let error = GetLastError();
            return Err(std::io::Error::from_raw_os_error(error as i32));
        }
    }
    Ok(())
}

/// Gets the granularity at which views can be placed, in bytes.
///
/// On Windows this is the allocation granularity (typically 64 KiB), not the
/// 4 KiB hardware page size: view base addresses must be multiples of it.
pub fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| unsafe {
        let mut system_info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut system_info);
        system_info.dwAllocationGranularity as usize
    })
}
