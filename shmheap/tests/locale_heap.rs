mod common;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{activate_locale, run_locale, test_config};
use shmheap::{HeapError, LocaleHeap, Pool, PoolConfig};

#[test]
fn base_is_identical_on_every_core() {
    let config = test_config("base", 0x5c10_0000_0000, 1 << 20);
    let bases = run_locale(4, config, |_, heap, _| {
        let base = heap.base() as usize;
        heap.finish().unwrap();
        base
    });
    assert!(bases.iter().all(|&b| b == 0x5c10_0000_0000));
}

#[test]
fn writes_are_visible_across_cores() {
    let config = test_config("visible", 0x5c20_0000_0000, 1 << 20);
    run_locale(3, config, |core, heap, barrier| {
        // Core 0 allocates a counter and publishes its address in the unused
        // tail of the segment; everyone bumps it.
        let slot = unsafe { &*(heap.base().add(heap.len() - 64) as *const AtomicU64) };
        if core == 0 {
            let p = heap.allocate(8).unwrap();
            unsafe { p.cast::<AtomicU64>().write(AtomicU64::new(0)) };
            slot.store(p.as_ptr() as u64, Ordering::Release);
        }
        barrier.wait();
        let counter = unsafe { &*(slot.load(Ordering::Acquire) as *const AtomicU64) };
        counter.fetch_add(core as u64 + 1, Ordering::AcqRel);
        barrier.wait();
        assert_eq!(counter.load(Ordering::Acquire), 1 + 2 + 3);
        barrier.wait();
        heap.finish().unwrap();
    });
}

#[test]
fn concurrent_allocation_is_disjoint_and_tracked_per_core() {
    let config = test_config("alloc", 0x5c30_0000_0000, 4 << 20);
    let results = run_locale(4, config, |_, heap, barrier| {
        let mut spans = Vec::new();
        for i in 0..200 {
            let size = 32 + (i % 7) * 40;
            let p = heap.allocate(size).unwrap();
            spans.push((p.as_ptr() as usize, size));
        }
        let allocated = heap.allocated();
        barrier.wait();
        heap.finish().unwrap();
        (spans, allocated)
    });

    let mut all: Vec<_> = results.iter().flat_map(|(s, _)| s.iter().copied()).collect();
    all.sort();
    for w in all.windows(2) {
        assert!(w[0].0 + w[0].1 <= w[1].0, "overlapping allocations");
    }
    for (spans, allocated) in &results {
        let requested: usize = spans.iter().map(|s| s.1).sum();
        assert!(*allocated >= requested);
    }
}

#[test]
fn pool_over_locale_heap() {
    let config = test_config("pool", 0x5c40_0000_0000, 1 << 20);
    run_locale(2, config, |_, heap, barrier| {
        {
            let mut pool = Pool::new(&heap, PoolConfig::new(128).with_objects_per_chunk(8)).unwrap();
            let objs: Vec<NonNull<u8>> = (0..20).map(|_| pool.allocate().unwrap()).collect();
            assert!(objs.iter().all(|p| heap.contains(p.as_ptr())));
            assert!(heap.allocated() >= 20 * 128);
            for p in objs {
                unsafe { pool.free(p) };
            }
            assert_eq!(pool.allocated_objects(), 0);
        }
        // Dropping the pool hands every chunk back.
        assert_eq!(heap.allocated(), 0);
        barrier.wait();
        heap.finish().unwrap();
    });
}

#[test]
fn creation_failure_releases_the_other_cores() {
    // Something else already occupies the base address, so core 0 cannot
    // create the segment.
    let base = 0x5c50_0000_0000;
    let occupant = LocaleHeap::activate(&test_config("occupant", base, 1 << 20), 0, 0, Ok::<bool, HeapError>).unwrap();

    let results = activate_locale(3, test_config("blocked", base, 1 << 20));
    assert!(matches!(&results[0], Err(HeapError::AddressInUse { .. } | HeapError::MapMismatch { .. })));
    for r in &results[1..] {
        assert!(matches!(r, Err(HeapError::PeerFailed { locale: 0 })), "{r:?}");
    }
    occupant.finish().unwrap();
}

#[test]
fn every_core_reports_the_same_base() {
    let results = activate_locale(2, test_config("agree", 0x5c60_0000_0000, 1 << 20));
    for r in results {
        assert_eq!(r.unwrap(), 0x5c60_0000_0000);
    }
}
