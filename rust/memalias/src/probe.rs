//! Discovery of a free virtual address range.

use memalias_common::Result;
use memalias_segment::MemorySegment;

/// Finds the base address of a currently free, page-aligned address range.
///
/// The range is only known to be free at the moment of the probe: any other
/// allocation in the process may claim it before the caller maps into it, so
/// callers must be prepared for the subsequent placement to fail.
pub trait RegionProbe: Send + Sync {
    fn find_free_region(&self, size: usize) -> Result<usize>;
}

/// Probes by creating a throwaway segment of the requested size at an OS-chosen
/// address and releasing it immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentProbe;

impl RegionProbe for SegmentProbe {
    fn find_free_region(&self, size: usize) -> Result<usize> {
        let mut probe = MemorySegment::new(size)?;
        let address = probe.address();
        probe.close()?;
        Ok(address)
    }
}
