//! Owned wrappers over the platform section seam.
//!
//! `Section` is the backing object and `Mapping` one view of it. Both release their
//! OS resource exactly once, either through an explicit `close`/`unmap` that reports
//! failures, or on drop.

use crate::section::{self, SectionHandle};

/// A kernel shared-memory object of a fixed, page-aligned size.
#[derive(Debug)]
pub(crate) struct Section {
    handle: Option<SectionHandle>,
    size: usize,
    #[cfg(test)]
    fail_next_close: bool,
}

impl Section {
    pub fn create(size: usize) -> std::io::Result<Section> {
        let handle = section::create_section(size)?;
        Ok(Section {
            handle: Some(handle),
            size,
            #[cfg(test)]
            fail_next_close: false,
        })
    }

    /// Maps the first `size` bytes of this object at `address` (0 lets the OS choose).
    pub fn map(&self, size: usize, address: usize, writable: bool) -> std::io::Result<Mapping> {
        let handle = self.handle.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "section is closed")
        })?;
        debug_assert!(size <= self.size);
        let address = section::map_view(handle, size, address, writable)?;
        Ok(Mapping {
            address,
            size,
            writable,
        })
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_close) {
            return Err(std::io::Error::other("injected close failure"));
        }
        if let Some(handle) = self.handle {
            unsafe { section::close_section(handle)? };
            self.handle = None;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Section {
    pub fn fail_next_close(&mut self) {
        self.fail_next_close = true;
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close shared memory section: {e}");
        }
    }
}

/// One mapping of a [`Section`]. An address of 0 marks an unmapped view.
#[derive(Debug)]
pub(crate) struct Mapping {
    address: usize,
    size: usize,
    writable: bool,
}

impl Mapping {
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.address != 0
    }

    /// Returns the mapped window, or an empty slice once unmapped.
    ///
    /// Other mappings of the same section may change these bytes at any time.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        if !self.is_mapped() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.size) }
    }

    /// Returns the mapped window for writing.
    ///
    /// # Panics
    ///
    /// Panics if the mapping is read-only; writing through it would fault.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        assert!(self.writable, "mapping is read-only");
        if !self.is_mapped() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.address as *mut u8, self.size) }
    }

    /// Copies `data` into the mapping at `offset` without forming a Rust reference
    /// to the destination.
    ///
    /// # Safety
    ///
    /// The mapping must be writable and mapped, and `offset + data.len()` must not
    /// exceed its size.
    pub unsafe fn write_unchecked(&self, offset: usize, data: &[u8]) {
        debug_assert!(self.writable && self.is_mapped());
        debug_assert!(offset + data.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.address as *mut u8).add(offset),
                data.len(),
            );
        }
    }

    pub fn unmap(&mut self) -> std::io::Result<()> {
        if self.is_mapped() {
            unsafe { section::unmap_view(self.address, self.size)? };
            self.address = 0;
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!(
                "failed to unmap view at {:#x} ({} bytes): {e}",
                self.address,
                self.size
            );
        }
    }
}
