//! Shared helpers for multi-core communicator tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use amsg::{CommConfig, Communicator, Fixed, LocalBackend, LocalFabric, Result, SiteAdapter};

/// Initializes one communicator per core, each on its own thread, and runs
/// `f` with it. Cores are laid out contiguously in locales of `locale_size`.
pub fn run_job<T, F>(cores: usize, locale_size: usize, config: CommConfig, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Communicator<LocalBackend>) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    run_init(
        cores,
        config,
        move |_| vec![Box::new(Fixed::new(locale_size)) as Box<dyn SiteAdapter>],
        |_| Vec::new(),
        move |_, comm| f(comm.expect("communicator init")),
    )
}

/// Like [`run_job`] but lets each core pick its own site adapters and
/// launcher environment, and hands `init`'s result to `f` unchecked.
pub fn run_init<T, A, E, F>(cores: usize, config: CommConfig, adapters: A, env: E, f: F) -> Vec<T>
where
    T: Send + 'static,
    A: Fn(usize) -> Vec<Box<dyn SiteAdapter>> + Send + Sync + 'static,
    E: Fn(usize) -> Vec<(String, String)> + Send + Sync + 'static,
    F: Fn(usize, Result<Communicator<LocalBackend>>) -> T + Send + Sync + 'static,
{
    let fabric = LocalFabric::new(cores);
    let adapters = Arc::new(adapters);
    let env = Arc::new(env);
    let f = Arc::new(f);
    let handles: Vec<_> = fabric
        .endpoints()
        .into_iter()
        .enumerate()
        .map(|(core, backend)| {
            let adapters = Arc::clone(&adapters);
            let env = Arc::clone(&env);
            let f = Arc::clone(&f);
            let config = config.clone();
            thread::spawn(move || {
                let vars: std::collections::HashMap<String, String> = env(core).into_iter().collect();
                let comm = Communicator::init(backend, config, &adapters(core), &vars);
                f(core, comm)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Drives progress until `done` holds.
pub fn progress_until(comm: &mut Communicator<LocalBackend>, mut done: impl FnMut() -> bool) {
    while !done() {
        comm.try_progress().unwrap();
        std::hint::spin_loop();
    }
}
