use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use memalias::{
    AliasComposer, ComposerConfig, MemorySegment, RegionProbe, Result, SegmentProbe, align,
    config::WASM_PAGE_SIZE, error::Error, error::ErrorKind,
};
use memalias_testkit::fill_pattern;

fn shared_segment(len: usize) -> MemorySegment {
    let mut segment = MemorySegment::new_aligned(len).expect("shared segment");
    for (i, v) in segment.as_mut_slice::<u32>().iter_mut().enumerate() {
        *v = i as u32;
    }
    segment
}

fn guest_memory(len: usize) -> Vec<u8> {
    let mut guest = vec![0u8; len];
    fill_pattern(&mut guest, 3);
    guest
}

/// Counts probes and otherwise behaves like the default probe.
#[derive(Default)]
struct CountingProbe {
    calls: AtomicUsize,
}

impl RegionProbe for CountingProbe {
    fn find_free_region(&self, size: usize) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SegmentProbe.find_free_region(size)
    }
}

/// Hands out free ranges but occupies their last page right away, simulating
/// another allocation winning the race for the range.
#[derive(Default)]
struct SquattingProbe {
    bases: Mutex<Vec<usize>>,
    squatters: Mutex<Vec<MemorySegment>>,
}

impl RegionProbe for SquattingProbe {
    fn find_free_region(&self, size: usize) -> Result<usize> {
        let base = SegmentProbe.find_free_region(size)?;
        let page = align::page_size();
        let squatter = MemorySegment::new_at(page, base + size - page)?;
        self.squatters.lock().unwrap().push(squatter);
        self.bases.lock().unwrap().push(base);
        Ok(base)
    }
}

struct FailingProbe;

impl RegionProbe for FailingProbe {
    fn find_free_region(&self, _size: usize) -> Result<usize> {
        Err(Error::mapping(
            "probe",
            std::io::Error::from_raw_os_error(12),
        ))
    }
}

#[test]
fn test_compose_splices_shared_window() {
    let page = align::page_size();
    let source = shared_segment(100_000 * 4);
    let n = source.size();
    let guest = guest_memory(2 * 1024 * 1024);
    let ptr = (5 * page + 1032) as u32;
    let pages = 64;

    let composer = AliasComposer::default();
    let composition = composer
        .compose(&source, &guest, ptr, pages)
        .expect("compose");

    assert_eq!(composition.size as usize, n);
    assert!((composition.offset as usize) < 3 * page);
    assert_eq!(composition.buffer.len, guest.len());
    assert_eq!(composition.buffer.capacity, pages as usize * WASM_PAGE_SIZE);
    assert_eq!(composition.buffer.address, composition.region.base());
    assert!(align::is_aligned(composition.region.base()));

    let start = ptr as usize + composition.offset as usize;
    let end = start + n;
    assert!(align::is_aligned(start));
    assert!(end <= ptr as usize + composer.reserved_size(n).unwrap());

    let composed = composition.region.as_bytes();
    assert_eq!(composed.len(), pages as usize * WASM_PAGE_SIZE);
    assert_eq!(&composed[..start], &guest[..start]);
    assert_eq!(&composed[start..end], source.as_bytes());
    assert_eq!(&composed[end..guest.len()], &guest[end..]);
    assert!(composed[guest.len()..].iter().all(|&b| b == 0));

    source.write_at(16, &[1, 2, 3, 4]).expect("write_at");
    assert_eq!(&composed[start + 16..start + 20], &[1, 2, 3, 4]);
    assert_eq!(composition.region.alias().as_bytes()[16], 1);
    assert_eq!(source.live_views(), 1);
}

#[test]
fn test_compose_at_guest_offset_zero_has_no_prefix() {
    let source = shared_segment(64 * 1024);
    let n = source.size();
    let guest = guest_memory(1024 * 1024);

    let composition = AliasComposer::default()
        .compose(&source, &guest, 0, 32)
        .expect("compose");
    assert_eq!(composition.offset, 0);

    let composed = composition.region.as_bytes();
    assert_eq!(&composed[..n], source.as_bytes());
    assert_eq!(&composed[n..guest.len()], &guest[n..]);
}

#[test]
fn test_compose_at_aligned_pointer() {
    let page = align::page_size();
    let source = shared_segment(3 * page);
    let guest = guest_memory(1024 * 1024);
    let ptr = (2 * page) as u32;

    let composition = AliasComposer::default()
        .compose(&source, &guest, ptr, 16)
        .expect("compose");
    assert_eq!(composition.offset, 0);
    assert_eq!(composition.size as usize, 3 * page);
    let composed = composition.region.as_bytes();
    assert_eq!(&composed[..2 * page], &guest[..2 * page]);
}

#[test]
fn test_layout_geometry() {
    let page = align::page_size();
    let composer = AliasComposer::default();
    let n = align::align_up(400_000);
    let layout = composer
        .layout(n, 2 * 1024 * 1024, (page + 8) as u32, 256)
        .expect("layout");

    assert_eq!(layout.total_size, 256 * WASM_PAGE_SIZE);
    assert_eq!(layout.reserved_size, n + 2 * page);
    assert_eq!(layout.window_start, 2 * page);
    assert_eq!(layout.window_offset(), page - 8);
    assert_eq!(layout.prefix_size(), 2 * page);
    assert_eq!(layout.window_end(), 2 * page + n);
    assert_eq!(
        layout.prefix_size() + layout.window_size + layout.suffix_size(),
        layout.total_size
    );
}

#[test]
fn test_invalid_requests_fail_before_probing() {
    let page = align::page_size();
    let source = shared_segment(4 * page);
    let guest = guest_memory(1024 * 1024);
    let composer =
        AliasComposer::with_probe(ComposerConfig::default(), CountingProbe::default())
            .expect("composer");

    // Reservation runs past the end of guest memory.
    let err = composer
        .compose(&source, &guest, (guest.len() - page) as u32, 16)
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    // Zero pages.
    let err = composer.compose(&source, &guest, 1032, 0).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    // Guest memory larger than the composed range.
    let err = composer.compose(&source, &guest, 1032, 8).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    assert_eq!(composer.probe().calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.live_views(), 0);
}

#[test]
fn test_placement_exhaustion_releases_every_attempt() {
    let page = align::page_size();
    let mut source = shared_segment(8 * page);
    let guest = guest_memory(1024 * 1024);
    let ptr = (3 * page + 1032) as u32;

    let config = ComposerConfig::default().with_max_attempts(4);
    let composer =
        AliasComposer::with_probe(config, SquattingProbe::default()).expect("composer");
    let err = composer.compose(&source, &guest, ptr, 32).unwrap_err();

    match err.kind() {
        ErrorKind::PlacementExhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(*attempts, 4);
            assert!(last_error.is_some());
        }
        other => panic!("unexpected error: {other}"),
    }

    let bases = composer.probe().bases.lock().unwrap().clone();
    assert_eq!(bases.len(), 4);

    // Every alias view was closed.
    assert_eq!(source.live_views(), 0);

    // The prefix of the last attempt was unmapped: its range can be claimed again.
    let layout = composer
        .layout(source.size(), guest.len(), ptr, 32)
        .expect("layout");
    let last = *bases.last().unwrap();
    let mut reclaimed =
        MemorySegment::new_at(layout.prefix_size(), last).expect("prefix range is free");
    reclaimed.close().expect("close");

    source.close().expect("source closes once no views remain");
}

#[test]
fn test_probe_failures_exhaust_attempts() {
    let page = align::page_size();
    let source = shared_segment(page);
    let guest = guest_memory(512 * 1024);

    let config = ComposerConfig::default().with_max_attempts(3);
    let composer = AliasComposer::with_probe(config, FailingProbe).expect("composer");
    let err = composer.compose(&source, &guest, 1032, 16).unwrap_err();
    assert!(err.is_placement_exhausted());
    assert!(err.to_string().contains("probe"), "{err}");
    assert_eq!(source.live_views(), 0);
}

#[test]
fn test_region_close_and_drop_release_views() {
    let page = align::page_size();
    let mut source = shared_segment(2 * page);
    let guest = guest_memory(512 * 1024);
    let composer = AliasComposer::default();

    let mut composition = composer
        .compose(&source, &guest, 1032, 16)
        .expect("compose");
    assert!(source.close().unwrap_err().is_busy());

    composition.region.close().expect("close region");
    assert!(composition.region.is_closed());
    assert!(composition.region.as_bytes().is_empty());
    assert_eq!(source.live_views(), 0);

    let composition = composer
        .compose(&source, &guest, 1032, 16)
        .expect("compose again");
    assert_eq!(source.live_views(), 1);
    drop(composition);
    assert_eq!(source.live_views(), 0);

    source.close().expect("close source");
}

#[test]
fn test_oversized_reservation_is_rejected() {
    let page = align::page_size();
    let composer = AliasComposer::default();
    let err = composer.reserved_size(usize::MAX - page).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    let err = composer
        .layout(usize::MAX & !(page - 1), usize::MAX, 1032, 16)
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    let huge_margin = ComposerConfig::default().with_margin_pages(usize::MAX / 2);
    let composer = AliasComposer::new(huge_margin).expect("composer");
    let err = composer.reserved_size(page).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = ComposerConfig::default().with_max_attempts(0);
    assert!(AliasComposer::new(config).is_err());
}
