//! Shared helpers for locale heap integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use shmheap::{HeapConfig, HeapError, HeapSize, LocaleHeap};

/// Heap config with a per-test name and base so tests can run in parallel.
pub fn test_config(tag: &str, base: usize, bytes: usize) -> HeapConfig {
    HeapConfig::default()
        .with_name(format!("/shmheap_it_{tag}_{}", std::process::id()))
        .with_base_address(base)
        .with_size(HeapSize::Bytes(bytes))
}

/// Agreement over threads: true when no thread reported a failure so far.
pub struct Agreement {
    barrier: Barrier,
    failures: AtomicUsize,
}

impl Agreement {
    pub fn new(cores: usize) -> Self {
        Self {
            barrier: Barrier::new(cores),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn agree(&self, ok: bool) -> Result<bool, HeapError> {
        if !ok {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        self.barrier.wait();
        let all = self.failures.load(Ordering::SeqCst) == 0;
        self.barrier.wait();
        Ok(all)
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }
}

/// Brings up the heap on `cores` threads of one locale; each core reports
/// its base address or its error.
pub fn activate_locale(cores: usize, config: HeapConfig) -> Vec<Result<usize, HeapError>> {
    let agreement = Arc::new(Agreement::new(cores));
    let config = Arc::new(config);
    let handles: Vec<_> = (0..cores)
        .map(|core| {
            let agreement = Arc::clone(&agreement);
            let config = Arc::clone(&config);
            std::thread::spawn(move || {
                let heap = LocaleHeap::activate(&config, 0, core, |ok| agreement.agree(ok))?;
                let base = heap.base() as usize;
                heap.finish()?;
                Ok(base)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Runs `f` on `cores` threads, each acting as one core of a single locale.
pub fn run_locale<T, F>(cores: usize, config: HeapConfig, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, LocaleHeap, &Barrier) -> T + Send + Sync + 'static,
{
    let agreement = Arc::new(Agreement::new(cores));
    let config = Arc::new(config);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..cores)
        .map(|core| {
            let agreement = Arc::clone(&agreement);
            let config = Arc::clone(&config);
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                let heap = LocaleHeap::activate(&config, 0, core, |ok| agreement.agree(ok))
                    .expect("locale heap activation");
                f(core, heap, agreement.barrier())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
