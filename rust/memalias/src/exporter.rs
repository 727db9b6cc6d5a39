//! Per-guest owner of a composition.
//!
//! A [`SharedMemoryExporter`] connects one guest instance to a shared segment. The
//! host calls [`create_view`](SharedMemoryExporter::create_view), which makes the
//! guest reserve memory and acknowledge it; the acknowledgment splices the shared
//! segment into the guest's linear memory exactly once. The exporter keeps the
//! composed mappings until it is closed or detached.

use std::sync::{Arc, Mutex, MutexGuard};

use memalias_common::{Result, error::Error};
use memalias_segment::{MemorySegment, View};

use crate::{
    composer::{AliasComposer, ComposedRegion},
    config::ComposerConfig,
    guest::{
        ACK_FAILURE_EXIT_CODE, AckHandler, GuestInstance, GuestMemory, LinearBuffer, pack_ack,
    },
    probe::{RegionProbe, SegmentProbe},
};

pub struct SharedMemoryExporter<P = SegmentProbe> {
    source: Arc<MemorySegment>,
    pages: u32,
    composer: AliasComposer<P>,
    state: Mutex<ExporterState>,
}

#[derive(Debug, Default)]
struct ExporterState {
    region: Option<ComposedRegion>,
    /// The guest buffer that the composed buffer replaced.
    replaced: Option<LinearBuffer>,
    closed: bool,
}

impl SharedMemoryExporter<SegmentProbe> {
    /// Creates an exporter for `source` with the default configuration.
    ///
    /// `pages` is the capacity of the guest's composed memory in guest pages.
    pub fn new(source: Arc<MemorySegment>, pages: u32) -> Result<Self> {
        Self::with_config(source, pages, ComposerConfig::default())
    }

    pub fn with_config(source: Arc<MemorySegment>, pages: u32, config: ComposerConfig) -> Result<Self> {
        Ok(Self::with_composer(source, pages, AliasComposer::new(config)?))
    }
}

impl<P: RegionProbe> SharedMemoryExporter<P> {
    pub fn with_composer(source: Arc<MemorySegment>, pages: u32, composer: AliasComposer<P>) -> Self {
        SharedMemoryExporter {
            source,
            pages,
            composer,
            state: Mutex::new(ExporterState::default()),
        }
    }

    pub fn source(&self) -> &Arc<MemorySegment> {
        &self.source
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    /// The number of bytes the guest is asked to reserve.
    pub fn reserved_size(&self) -> Result<usize> {
        self.composer.reserved_size(self.source.size())
    }

    /// Whether the shared segment is currently spliced into the guest.
    pub fn is_attached(&self) -> bool {
        self.lock().region.is_some()
    }

    /// Runs `f` on the alias view inside the guest's memory, if attached.
    pub fn with_export_view<R>(&self, f: impl FnOnce(&View) -> R) -> Option<R> {
        self.lock().region.as_ref().map(|region| f(region.alias()))
    }

    /// Asks the guest to reserve memory for the shared window and verifies the
    /// size it reports back.
    ///
    /// The guest's reservation entry point calls back into
    /// [`acknowledge`](AckHandler::acknowledge) before returning.
    ///
    /// # Errors
    ///
    /// `ProtocolMismatch` if the guest reports a size other than the shared
    /// segment's size, plus any error of the guest call itself.
    pub fn create_view(&self, guest: &mut dyn GuestInstance) -> Result<()> {
        let reserved_size = u32::try_from(self.reserved_size()?)
            .map_err(|_| Error::invalid_arg("source", "reservation exceeds guest address space"))?;
        let reported = guest.request_memory(reserved_size)?;
        let expected = self.source.size() as u64;
        if reported != expected {
            return Err(Error::protocol_mismatch(expected, reported));
        }
        Ok(())
    }

    /// Splices the shared segment into the guest's memory at the reservation `ptr`
    /// and returns the packed `(offset, size)` answer.
    ///
    /// Composition runs at most once: later calls leave the guest memory alone and
    /// return the shared segment's size on its own.
    pub fn try_acknowledge(&self, memory: &mut dyn GuestMemory, ptr: u32) -> Result<u64> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::invalid_operation("acknowledge on a closed exporter"));
        }
        if state.region.is_some() {
            return Ok(self.source.size() as u64);
        }

        let current = memory.buffer();
        let guest = unsafe { current.as_bytes() };
        let composition = self
            .composer
            .compose(&self.source, guest, ptr, self.pages)?;

        let previous = unsafe { memory.replace_buffer(composition.buffer) };
        state.replaced = Some(previous);
        state.region = Some(composition.region);
        Ok(pack_ack(composition.offset, composition.size))
    }

    /// Restores a copy of the guest's current memory into the buffer it had before
    /// composition, reinstalls that buffer and releases the composed mappings.
    ///
    /// This is the teardown path for a guest that keeps running. The copy is
    /// truncated to the original buffer's capacity.
    pub fn detach(&self, memory: &mut dyn GuestMemory) -> Result<()> {
        let mut state = self.lock();
        let Some(mut region) = state.region.take() else {
            return Ok(());
        };
        let Some(original) = state.replaced.take() else {
            return region.close();
        };

        let current = memory.buffer();
        let len = current.len.min(original.capacity);
        unsafe {
            let src = current.as_bytes();
            original.as_capacity_mut()[..len].copy_from_slice(&src[..len]);
            memory.replace_buffer(LinearBuffer {
                address: original.address,
                len,
                capacity: original.capacity,
            });
        }
        region.close()
    }

    /// Releases the alias view and both private segments.
    ///
    /// The guest must not run against the composed buffer afterwards; use
    /// [`detach`](Self::detach) to hand it its own memory back first.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        state.closed = true;
        state.replaced = None;
        if let Some(mut region) = state.region.take() {
            region.close()?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ExporterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P: RegionProbe> AckHandler for SharedMemoryExporter<P> {
    fn acknowledge(&self, memory: &mut dyn GuestMemory, ptr: u32) -> u64 {
        match self.try_acknowledge(memory, ptr) {
            Ok(answer) => answer,
            Err(e) => {
                log::error!("failed to splice shared memory at guest pointer {ptr:#x}: {e}");
                memory.terminate(ACK_FAILURE_EXIT_CODE);
                0
            }
        }
    }
}
