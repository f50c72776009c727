//! Shared helpers for multi-core mesh tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use amsg::{CommConfig, Communicator, Fixed, LocalBackend, LocalFabric, SiteAdapter};
use rcmesh::{Mesh, MeshConfig, SoftFabric, SoftVerbs};

pub type Comm = Communicator<LocalBackend>;

/// Runs `f` on one thread per core with a connected communicator and mesh.
/// Cores of one locale share a LID.
pub fn run_mesh<T, F>(cores: usize, locale_size: usize, fabric: SoftFabric, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&mut Comm, &mut Mesh<SoftVerbs>) -> T + Send + Sync + 'static,
{
    let transport = LocalFabric::new(cores);
    let f = Arc::new(f);
    let handles: Vec<_> = transport
        .endpoints()
        .into_iter()
        .map(|backend| {
            let f = Arc::clone(&f);
            let fabric = fabric.clone();
            thread::spawn(move || {
                let adapters = vec![Box::new(Fixed::new(locale_size)) as Box<dyn SiteAdapter>];
                let env = std::collections::HashMap::<String, String>::new();
                let mut comm = Communicator::init(backend, CommConfig::default(), &adapters, &env).unwrap();
                let lid = (comm.locale() + 1) as u16;
                let mut mesh = Mesh::open_device(fabric.verbs(lid), MeshConfig::default()).unwrap();
                mesh.connect(&mut comm).unwrap();
                let out = f(&mut comm, &mut mesh);
                comm.finish().unwrap();
                out
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
