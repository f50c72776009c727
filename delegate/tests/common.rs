//! Shared helpers for multi-core delegate tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use amsg::{CommConfig, Communicator, Fixed, LocalBackend, LocalFabric, SiteAdapter};

pub type Comm = Communicator<LocalBackend>;

/// Runs `f` on one thread per core with an initialized (not yet active)
/// communicator. All cores share one locale.
pub fn run_job<T, F>(cores: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Comm) -> T + Send + Sync + 'static,
{
    let fabric = LocalFabric::new(cores);
    let f = Arc::new(f);
    let handles: Vec<_> = fabric
        .endpoints()
        .into_iter()
        .map(|backend| {
            let f = Arc::clone(&f);
            thread::spawn(move || {
                let adapters = vec![Box::new(Fixed::new(cores)) as Box<dyn SiteAdapter>];
                let env = HashMap::<String, String>::new();
                f(Communicator::init(backend, CommConfig::default(), &adapters, &env).unwrap())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
