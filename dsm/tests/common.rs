//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use amsg::{Core, Fixed, LocalBackend, LocalFabric, SiteAdapter};
use dsm::{Config, Runtime};
use rcmesh::{SoftFabric, SoftVerbs};
use shmheap::{HeapConfig, HeapSize};

pub type Rt = Runtime<LocalBackend, SoftVerbs>;

/// Config for cores that share one process: per-test heap names, one heap
/// per locale, and a scratch region placed by the kernel.
pub fn test_config(tag: &str, heap_base: usize) -> Config {
    let heap = HeapConfig::default()
        .with_name(format!("/dsm_it_{tag}_{}", std::process::id()))
        .with_base_address(heap_base)
        .with_size(HeapSize::Bytes(1 << 20))
        .with_colocated_locales(true);
    Config::default()
        .with_heap(heap)
        .with_scratch_bytes(1 << 20)
        .with_scratch_base(None)
}

/// Runs `f` on one thread per core with an initialized runtime. Cores of a
/// locale share a LID on the software fabric.
pub fn run_job<T, F>(cores: usize, locale_size: usize, config: Config, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Rt) -> T + Send + Sync + 'static,
{
    run_job_with(
        cores,
        move |_| vec![Box::new(Fixed::new(locale_size)) as Box<dyn SiteAdapter>],
        move |core| (core / locale_size + 1) as u16,
        config,
        f,
    )
}

/// Like [`run_job`] with per-core launcher adapters and LIDs.
pub fn run_job_with<T, A, L, F>(cores: usize, adapters: A, lid: L, config: Config, f: F) -> Vec<T>
where
    T: Send + 'static,
    A: Fn(Core) -> Vec<Box<dyn SiteAdapter>> + Send + Sync + 'static,
    L: Fn(Core) -> u16,
    F: Fn(Rt) -> T + Send + Sync + 'static,
{
    dsm::logging::init_for_tests();
    let transport = LocalFabric::new(cores);
    let rdma = SoftFabric::new();
    let adapters = Arc::new(adapters);
    let f = Arc::new(f);
    let handles: Vec<_> = transport
        .endpoints()
        .into_iter()
        .enumerate()
        .map(|(core, backend)| {
            let adapters = Arc::clone(&adapters);
            let f = Arc::clone(&f);
            let verbs = rdma.verbs(lid(core));
            let config = config.clone();
            thread::spawn(move || {
                let env = HashMap::<String, String>::new();
                f(Runtime::init(backend, verbs, config, &adapters(core), &env).unwrap())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
