use std::sync::Arc;

use memalias_segment::{MemorySegment, align};

#[test]
fn test_views_observe_writes_from_another_thread() {
    let page = align::page_size();
    let segment = Arc::new(MemorySegment::new(4 * page).unwrap());
    let views: Vec<_> = (0..4)
        .map(|_| segment.attach_view(0).unwrap())
        .collect();
    assert_eq!(segment.live_views(), 4);

    let values: Vec<u64> = (0..512).map(|_| fastrand::u64(..)).collect();
    let writer = {
        let segment = segment.clone();
        let values = values.clone();
        std::thread::spawn(move || {
            for (i, v) in values.iter().enumerate() {
                segment.write_at(i * 8, &v.to_le_bytes()).unwrap();
            }
        })
    };
    writer.join().unwrap();

    for view in &views {
        assert_eq!(&view.as_slice::<u64>()[..values.len()], &values[..]);
        assert!(!view.is_writable());
    }

    drop(views);
    assert_eq!(segment.live_views(), 0);
    let mut segment = Arc::try_unwrap(segment).unwrap();
    segment.close().unwrap();
    assert!(segment.is_closed());
    assert!(segment.as_bytes().is_empty());
}

#[test]
fn test_segments_at_adjacent_addresses() {
    let page = align::page_size();

    // Claim a free range, release it, then rebuild it from two segments.
    let mut probe = MemorySegment::new(6 * page).unwrap();
    let base = probe.address();
    probe.close().unwrap();

    let mut low = MemorySegment::new_at(2 * page, base).unwrap();
    let mut high = MemorySegment::new_at(4 * page, base + 2 * page).unwrap();
    low.as_bytes_mut().fill(1);
    high.as_bytes_mut().fill(2);

    let whole = unsafe { std::slice::from_raw_parts(base as *const u8, 6 * page) };
    assert!(whole[..2 * page].iter().all(|&b| b == 1));
    assert!(whole[2 * page..].iter().all(|&b| b == 2));

    // Overlapping placement is refused.
    let err = MemorySegment::new_at(page, base + page).unwrap_err();
    assert!(!err.is_invalid_argument(), "{err}");

    low.close().unwrap();
    high.close().unwrap();
}
