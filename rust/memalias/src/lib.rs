//! Zero-copy sharing of host memory with a sandboxed guest.
//!
//! A window of the guest's linear memory is remapped onto the pages of a host
//! [`MemorySegment`](memalias_segment::MemorySegment), so the guest reads what the
//! host writes without any copying. See [`composer`] for the layout and
//! [`exporter`] for the per-guest protocol.

pub mod composer;
pub mod config;
pub mod exporter;
pub mod guest;
pub mod probe;

pub use composer::{AliasComposer, AliasLayout, ComposedRegion, Composition};
pub use config::ComposerConfig;
pub use exporter::SharedMemoryExporter;
pub use guest::{AckHandler, GuestInstance, GuestMemory, LinearBuffer};
pub use probe::{RegionProbe, SegmentProbe};

pub use memalias_common::{Result, error};
pub use memalias_segment::{MemorySegment, View, align};
