//! Shared memory segments and their aliasing views.
//!
//! A [`MemorySegment`] owns one shared-memory backing object together with its
//! primary, writable mapping. Additional [`View`]s of the same backing can be
//! attached at caller-chosen addresses; all of them observe the same physical
//! pages, so a write through any mapping is immediately visible through every
//! other one.
//!
//! # Ownership
//!
//! Views are counted by their parent segment. [`MemorySegment::close`] refuses to
//! release the backing while any view is still open and reports
//! [`ErrorKind::ResourceBusy`](memalias_common::error::ErrorKind::ResourceBusy).
//! Views close themselves on drop, and a segment handle dropped while views remain
//! open keeps the backing alive until the last view is gone.

use std::sync::{Arc, Mutex, MutexGuard};

use memalias_common::{Result, error::Error, verify_arg};

use crate::{
    align,
    backing::{Mapping, Section},
};

/// A page-aligned shared memory segment.
///
/// The segment's bytes are accessible through [`as_bytes`](Self::as_bytes) and
/// [`as_bytes_mut`](Self::as_bytes_mut). The window is fixed-size: it can't grow,
/// and copying it into a `Vec` detaches the copy from the shared pages.
#[derive(Debug)]
pub struct MemorySegment {
    shared: Arc<SegmentShared>,
    address: usize,
    size: usize,
    open: bool,
}

#[derive(Debug)]
struct SegmentShared {
    state: Mutex<SegmentState>,
}

/// Field order matters: the primary mapping must be released before the section.
#[derive(Debug)]
struct SegmentState {
    primary: Option<Mapping>,
    section: Option<Section>,
    live_views: usize,
}

impl SegmentShared {
    fn lock(&self) -> MutexGuard<'_, SegmentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemorySegment {
    /// Creates a segment of `capacity` bytes at an address chosen by the OS.
    ///
    /// `capacity` must be a non-zero multiple of [`align::page_size`].
    pub fn new(capacity: usize) -> Result<MemorySegment> {
        Self::new_at(capacity, 0)
    }

    /// Creates a segment of at least `capacity` bytes, rounded up to whole pages.
    ///
    /// A zero `capacity`, or one that overflows when rounded up, is rejected with
    /// `InvalidArgument`.
    pub fn new_aligned(capacity: usize) -> Result<MemorySegment> {
        let aligned = align::checked_align_up(capacity)
            .ok_or_else(|| Error::invalid_arg("capacity", "overflows when page aligned"))?;
        Self::new_at(aligned, 0)
    }

    /// Creates a segment of `capacity` bytes whose primary mapping starts exactly at
    /// `address`, or at an OS-chosen address if `address` is 0.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `capacity` is not a non-zero multiple of the page size
    ///   or `address` is not page aligned. No OS call is made in that case.
    /// - `PlatformMappingFailure` if the backing can't be created or the requested
    ///   range is not free.
    pub fn new_at(capacity: usize, address: usize) -> Result<MemorySegment> {
        verify_arg!(capacity, capacity >= align::page_size());
        verify_arg!(capacity, align::is_aligned(capacity));
        verify_arg!(address, align::is_aligned(address));

        let section = Section::create(capacity).map_err(|e| Error::mapping("create_section", e))?;
        // On failure the section is released by its drop.
        let primary = section
            .map(capacity, address, true)
            .map_err(|e| Error::mapping("map_view", e))?;
        let base = primary.address();
        log::trace!("created segment of {capacity} bytes at {base:#x}");

        Ok(MemorySegment {
            shared: Arc::new(SegmentShared {
                state: Mutex::new(SegmentState {
                    primary: Some(primary),
                    section: Some(section),
                    live_views: 0,
                }),
            }),
            address: base,
            size: capacity,
            open: true,
        })
    }

    /// The capacity of the segment in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The virtual address of the first byte of the primary mapping.
    ///
    /// Remains meaningful only while the segment is open.
    #[inline]
    pub fn address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        !self.open
    }

    /// Number of attached views that have not been closed yet.
    pub fn live_views(&self) -> usize {
        self.shared.lock().live_views
    }

    /// The primary mapping as a byte slice; empty once the segment is closed.
    ///
    /// Bytes may change underneath the slice through other mappings of the same
    /// backing. Synchronizing such accesses is up to the caller.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        if !self.open {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.size) }
    }

    /// The primary mapping as a mutable byte slice; empty once the segment is closed.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if !self.open {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.address as *mut u8, self.size) }
    }

    /// Reinterprets the segment's bytes as a slice of `T`.
    ///
    /// # Panics
    ///
    /// Panics if the segment size is not a multiple of `size_of::<T>()`.
    #[inline]
    pub fn as_slice<T>(&self) -> &[T]
    where
        T: bytemuck::AnyBitPattern,
    {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Reinterprets the segment's bytes as a mutable slice of `T`.
    #[inline]
    pub fn as_mut_slice<T>(&mut self) -> &mut [T]
    where
        T: bytemuck::AnyBitPattern + bytemuck::NoUninit,
    {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }

    /// Copies `data` into the segment at `offset` through a shared reference.
    ///
    /// This is how a segment shared behind an `Arc` is filled by its owner. Readers
    /// of other mappings observe the bytes with no ordering guarantees.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        verify_arg!(offset, offset <= self.size && data.len() <= self.size - offset);
        let state = self.shared.lock();
        let primary = state
            .primary
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("write_at on a closed segment"))?;
        unsafe { primary.write_unchecked(offset, data) };
        Ok(())
    }

    /// Attaches a read-only view of the whole segment at `address` (0 lets the OS
    /// choose). Writing through the returned view faults.
    pub fn attach_view(&self, address: usize) -> Result<View> {
        self.attach(address, false)
    }

    /// Attaches a writable view of the whole segment at `address` (0 lets the OS
    /// choose).
    pub fn attach_writable_view(&self, address: usize) -> Result<View> {
        self.attach(address, true)
    }

    fn attach(&self, address: usize, writable: bool) -> Result<View> {
        verify_arg!(address, align::is_aligned(address));

        let mut state = self.shared.lock();
        let section = state
            .section
            .as_ref()
            .ok_or_else(|| Error::invalid_operation("attach_view on a closed segment"))?;
        let mapping = section
            .map(self.size, address, writable)
            .map_err(|e| Error::mapping("map_view", e))?;
        state.live_views += 1;
        log::trace!(
            "attached view at {:#x} to segment at {:#x} ({} live)",
            mapping.address(),
            self.address,
            state.live_views
        );

        Ok(View {
            mapping,
            parent: Some(Arc::clone(&self.shared)),
        })
    }

    /// Releases the primary mapping and then the backing object.
    ///
    /// Fails with `ResourceBusy` and leaves the segment open while views are still
    /// attached. Once the primary mapping is gone the segment counts as closed, even
    /// if releasing the backing object then fails; calling `close` again retries that
    /// last step. Closing a fully closed segment does nothing.
    pub fn close(&mut self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.section.is_none() {
            return Ok(());
        }
        if state.live_views > 0 {
            return Err(Error::busy(state.live_views));
        }
        if let Some(primary) = state.primary.as_mut() {
            primary.unmap().map_err(|e| Error::mapping("unmap_view", e))?;
        }
        state.primary = None;
        self.open = false;

        if let Some(section) = state.section.as_mut() {
            section
                .close()
                .map_err(|e| Error::mapping("close_section", e))?;
        }
        state.section = None;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_section_close(&self) {
        if let Some(section) = self.shared.lock().section.as_mut() {
            section.fail_next_close();
        }
    }
}

/// A secondary mapping of a [`MemorySegment`].
///
/// The view doesn't own the backing object; it only keeps it from being released
/// while the view is mapped. Closing the view (explicitly or by dropping it)
/// unmaps it and decrements the parent's view count.
#[derive(Debug)]
pub struct View {
    mapping: Mapping,
    parent: Option<Arc<SegmentShared>>,
}

impl View {
    #[inline]
    pub fn address(&self) -> usize {
        self.mapping.address()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.mapping.is_writable()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.parent.is_none()
    }

    /// The view's window as a byte slice; empty once the view is closed.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.mapping.as_bytes()
    }

    /// The view's window as a mutable byte slice.
    ///
    /// # Panics
    ///
    /// Panics if the view was attached read-only.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.mapping.as_bytes_mut()
    }

    #[inline]
    pub fn as_slice<T>(&self) -> &[T]
    where
        T: bytemuck::AnyBitPattern,
    {
        bytemuck::cast_slice(self.as_bytes())
    }

    /// Raw pointer to the first byte of the view, regardless of its permissions.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.address() as *mut u8
    }

    /// Unmaps the view and releases its hold on the parent segment.
    ///
    /// A view that is already closed does nothing. If unmapping fails, the view
    /// stays open and still counts against its parent.
    pub fn close(&mut self) -> Result<()> {
        let Some(parent) = self.parent.take() else {
            return Ok(());
        };
        let mut state = parent.lock();
        if let Err(e) = self.mapping.unmap() {
            drop(state);
            self.parent = Some(parent);
            return Err(Error::mapping("unmap_view", e));
        }
        state.live_views -= 1;
        Ok(())
    }
}

impl Drop for View {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close view: {e}");
        }
    }
}
