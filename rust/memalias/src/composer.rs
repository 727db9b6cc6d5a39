//! Splicing a shared segment into a guest's linear memory.
//!
//! The composed guest memory is one contiguous address range made of three parts:
//!
//! ```text
//!  base                 base + window_start        base + window_end         base + total
//!   |  private prefix      |  alias of the shared     |  private suffix          |
//!   |  (copy of guest)     |  segment (no copy)       |  (copy of guest)         |
//! ```
//!
//! The window starts at the first page boundary inside the guest's reservation.
//! Finding `base` is a probe-then-claim race against every other allocation in the
//! process, so the whole composition is retried a bounded number of times.

use memalias_common::{Result, error::Error, verify_arg};
use memalias_segment::{MemorySegment, View, align};

use crate::{
    config::ComposerConfig,
    guest::LinearBuffer,
    probe::{RegionProbe, SegmentProbe},
};

/// Geometry of a composition, relative to the guest's offset 0.
///
/// The private suffix begins at `window_end`, so the reservation slack after the
/// shared window stays mapped as part of the suffix and keeps the guest's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasLayout {
    /// Size of the whole composed range.
    pub total_size: usize,
    /// Guest reservation pointer.
    pub reservation: usize,
    /// Size of the guest reservation, including the margin pages.
    pub reserved_size: usize,
    /// First page boundary at or after `reservation`.
    pub window_start: usize,
    /// Size of the shared window (the shared segment's size).
    pub window_size: usize,
}

impl AliasLayout {
    #[inline]
    pub fn prefix_size(&self) -> usize {
        self.window_start
    }

    #[inline]
    pub fn window_end(&self) -> usize {
        self.window_start + self.window_size
    }

    #[inline]
    pub fn suffix_size(&self) -> usize {
        self.total_size - self.window_end()
    }

    /// Offset of the shared window from the reservation pointer.
    #[inline]
    pub fn window_offset(&self) -> usize {
        self.window_start - self.reservation
    }
}

/// The outcome of a successful composition.
#[derive(Debug)]
pub struct Composition {
    /// The composed buffer to install as the guest's linear memory.
    pub buffer: LinearBuffer,
    /// Offset of the shared window from the guest's reservation pointer.
    pub offset: u32,
    /// Number of valid bytes in the shared window.
    pub size: u32,
    /// The mappings that make up the composed range.
    pub region: ComposedRegion,
}

/// The mappings backing a composed range: the private prefix, the alias of the
/// shared segment and the private suffix.
///
/// All parts are released together by [`close`](Self::close), or on drop.
#[derive(Debug)]
pub struct ComposedRegion {
    base: usize,
    size: usize,
    prefix: Option<MemorySegment>,
    alias: View,
    suffix: MemorySegment,
}

impl ComposedRegion {
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The read-only view of the shared segment placed inside the range.
    #[inline]
    pub fn alias(&self) -> &View {
        &self.alias
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.alias.is_closed()
    }

    /// The whole composed range; empty once closed.
    pub fn as_bytes(&self) -> &[u8] {
        if self.is_closed() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) }
    }

    /// Unmaps the alias and both private parts.
    pub fn close(&mut self) -> Result<()> {
        self.alias.close()?;
        if let Some(prefix) = self.prefix.as_mut() {
            prefix.close()?;
        }
        self.suffix.close()
    }
}

/// Composes guest memory around a shared segment.
pub struct AliasComposer<P = SegmentProbe> {
    config: ComposerConfig,
    probe: P,
}

impl AliasComposer<SegmentProbe> {
    pub fn new(config: ComposerConfig) -> Result<Self> {
        Self::with_probe(config, SegmentProbe)
    }
}

impl Default for AliasComposer<SegmentProbe> {
    fn default() -> Self {
        AliasComposer {
            config: ComposerConfig::default(),
            probe: SegmentProbe,
        }
    }
}

impl<P: RegionProbe> AliasComposer<P> {
    pub fn with_probe(config: ComposerConfig, probe: P) -> Result<Self> {
        config.validate()?;
        Ok(AliasComposer { config, probe })
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// The number of bytes a guest must reserve to host a window of `window_size`.
    ///
    /// Fails with `InvalidArgument` if the reservation doesn't fit in `usize`.
    pub fn reserved_size(&self, window_size: usize) -> Result<usize> {
        align::checked_align_up_with_margin(window_size, self.config.margin_pages)
            .ok_or_else(|| Error::invalid_arg("window_size", "reservation size overflows"))
    }

    /// Computes and validates the geometry of a composition.
    ///
    /// # Arguments
    ///
    /// * `window_size` - Size of the shared segment.
    /// * `guest_len` - Current length of the guest's linear memory.
    /// * `ptr` - The guest's reservation pointer.
    /// * `pages` - Capacity of the composed memory, in guest pages.
    pub fn layout(
        &self,
        window_size: usize,
        guest_len: usize,
        ptr: u32,
        pages: u32,
    ) -> Result<AliasLayout> {
        let total_size = (pages as usize)
            .checked_mul(self.config.guest_page_size)
            .ok_or_else(|| Error::invalid_arg("pages", "composed size overflows"))?;
        verify_arg!(pages, total_size > 0 && align::is_aligned(total_size));
        verify_arg!(window_size, window_size > 0 && align::is_aligned(window_size));
        verify_arg!(window_size, window_size <= u32::MAX as usize);

        let reservation = ptr as usize;
        let reserved_size = self.reserved_size(window_size)?;
        let window_start = align::next_aligned_address(reservation);
        let layout = AliasLayout {
            total_size,
            reservation,
            reserved_size,
            window_start,
            window_size,
        };

        let reservation_end = reservation
            .checked_add(reserved_size)
            .ok_or_else(|| Error::invalid_arg("ptr", "reservation end overflows"))?;
        verify_arg!(ptr, reservation_end <= guest_len);
        verify_arg!(ptr, layout.window_end() <= reservation_end);
        verify_arg!(pages, guest_len <= total_size);
        Ok(layout)
    }

    /// Splices `source` into a copy of `guest` at the reservation `ptr`.
    ///
    /// The returned buffer has the guest's length and a capacity of `pages` guest
    /// pages. Bytes outside the shared window are copies of `guest`; the window
    /// itself is a read-only alias of `source`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the reservation does not fit the guest memory or the
    ///   composed range.
    /// - `PlacementExhausted` if no free range could be claimed within
    ///   `max_attempts`. Nothing created by the failed attempts stays mapped.
    pub fn compose(
        &self,
        source: &MemorySegment,
        guest: &[u8],
        ptr: u32,
        pages: u32,
    ) -> Result<Composition> {
        let layout = self.layout(source.size(), guest.len(), ptr, pages)?;

        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts {
            match self.try_compose(source, guest, &layout) {
                Ok(region) => {
                    log::debug!(
                        "composed {} bytes at {:#x}: window {:#x}..{:#x} (attempt {attempt})",
                        layout.total_size,
                        region.base(),
                        layout.window_start,
                        layout.window_end(),
                    );
                    return Ok(Composition {
                        buffer: LinearBuffer {
                            address: region.base(),
                            len: guest.len(),
                            capacity: layout.total_size,
                        },
                        offset: layout.window_offset() as u32,
                        size: layout.window_size as u32,
                        region,
                    });
                }
                Err(e) => {
                    log::debug!(
                        "placement attempt {attempt}/{} failed: {e}",
                        self.config.max_attempts
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(Error::placement_exhausted(
            self.config.max_attempts,
            last_error,
        ))
    }

    /// A single probe-and-claim attempt. Parts created before a failure are
    /// released when they go out of scope.
    fn try_compose(
        &self,
        source: &MemorySegment,
        guest: &[u8],
        layout: &AliasLayout,
    ) -> Result<ComposedRegion> {
        let base = self.probe.find_free_region(layout.total_size)?;

        let prefix = if layout.prefix_size() > 0 {
            let mut prefix = MemorySegment::new_at(layout.prefix_size(), base)?;
            prefix
                .as_bytes_mut()
                .copy_from_slice(&guest[..layout.prefix_size()]);
            Some(prefix)
        } else {
            None
        };

        let alias = source.attach_view(base + layout.window_start)?;

        let mut suffix = MemorySegment::new_at(layout.suffix_size(), base + layout.window_end())?;
        let tail = &guest[layout.window_end()..];
        suffix.as_bytes_mut()[..tail.len()].copy_from_slice(tail);

        Ok(ComposedRegion {
            base,
            size: layout.total_size,
            prefix,
            alias,
            suffix,
        })
    }
}
