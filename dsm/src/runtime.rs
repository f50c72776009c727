//! The per-core runtime context.
//!
//! `init` joins the job and agrees on geometry; handlers and delegate
//! operations are registered next, identically on every core; `activate`
//! brings up the locale heap, the RDMA mesh and the pinned regions and
//! starts receiving; `finish` tears everything down collectively.
//!
//! The job is fail-stop. Operations return misuse (wrong state, bad
//! arguments) as errors; transport, RDMA, heap and geometry failures are
//! logged and abort the process through [`fatal`](crate::fatal).

use std::ptr::NonNull;

use amsg::{Backend, Collectives, Communicator, Core, Environment, SiteAdapter};
use delegate::{DelegateId, DelegateOp, Delegates, Promise};
use rcmesh::{Mesh, PinnedRegion, Placement, Verbs};
use shmheap::LocaleHeap;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result, fail_stop, fatal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Active,
    Finished,
}

/// One core's view of the job.
pub struct Runtime<B: Backend, V: Verbs> {
    // Regions deregister before the mesh and the heap go away.
    scratch: Option<PinnedRegion<V>>,
    heap_region: Option<PinnedRegion<V>>,
    mesh: Mesh<V>,
    heap: Option<LocaleHeap>,
    delegates: Delegates,
    comm: Communicator<B>,
    config: Config,
    state: State,
}

impl<B: Backend, V: Verbs> Runtime<B, V> {
    /// Joins the job. Collective.
    pub fn init(
        backend: B,
        verbs: V,
        config: Config,
        adapters: &[Box<dyn SiteAdapter>],
        env: &dyn Environment,
    ) -> Result<Self> {
        config.validate()?;
        fail_stop(Self::join(backend, verbs, config, adapters, env))
    }

    fn join(
        backend: B,
        verbs: V,
        config: Config,
        adapters: &[Box<dyn SiteAdapter>],
        env: &dyn Environment,
    ) -> Result<Self> {
        let mut comm = Communicator::init(backend, config.comm.clone(), adapters, env)?;
        let delegates = Delegates::new(&mut comm)?;
        let mesh = Mesh::open_device(verbs, config.mesh)?;
        Ok(Self {
            scratch: None,
            heap_region: None,
            mesh,
            heap: None,
            delegates,
            comm,
            config,
            state: State::Init,
        })
    }

    fn expect_state(&self, op: &'static str, state: State) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        let expected = match state {
            State::Init => "initializing",
            State::Active => "active",
            State::Finished => "finished",
        };
        Err(Error::State { op, expected })
    }

    /// Registers a delegate operation. Must happen before [`activate`](Self::activate),
    /// in the same order on every core.
    pub fn register_delegate<Op, F>(&mut self, f: F) -> Result<DelegateId<Op>>
    where
        Op: DelegateOp,
        F: FnMut(Op) -> Op::Output + 'static,
    {
        self.expect_state("register_delegate", State::Init)?;
        fail_stop(self.delegates.register(&mut self.comm, f).map_err(Error::from))
    }

    /// Brings up the heap, the mesh and the pinned regions. Collective.
    pub fn activate(&mut self) -> Result<()> {
        self.expect_state("activate", State::Init)?;
        fail_stop(self.bring_up())
    }

    fn bring_up(&mut self) -> Result<()> {
        let comm = &mut self.comm;
        let (locale, locale_core) = (comm.locale(), comm.locale_core());

        let heap = LocaleHeap::activate(&self.config.heap, locale, locale_core, |ok| agree(comm, ok))?;
        self.mesh.connect(comm)?;

        let placement = self.config.scratch_base.map_or(Placement::Anywhere, Placement::Fixed);
        self.scratch = Some(PinnedRegion::new(&self.mesh, comm, self.config.scratch_bytes, placement)?);
        if self.config.register_heap {
            // The region is dropped before the heap (field order).
            self.heap_region = Some(unsafe { PinnedRegion::from_heap(&self.mesh, comm, &heap)? });
        }
        self.heap = Some(heap);

        comm.activate()?;
        self.state = State::Active;
        info!(
            core = comm.mycore(),
            cores = comm.cores(),
            locale,
            locale_core,
            site = comm.site(),
            "runtime active"
        );
        Ok(())
    }

    /// Calls `op` on `core` through the two-sided transport.
    pub fn call<Op: DelegateOp>(&mut self, core: Core, id: DelegateId<Op>, op: &Op) -> Result<Promise<Op::Output>> {
        self.expect_state("call", State::Active)?;
        fail_stop(self.delegates.call(&mut self.comm, core, id, op).map_err(Error::from))
    }

    /// Calls `op` on `core` and waits for the output.
    pub fn delegate<Op: DelegateOp>(&mut self, core: Core, id: DelegateId<Op>, op: &Op) -> Result<Op::Output> {
        let promise = self.call(core, id, op)?;
        self.wait(promise)
    }

    pub fn wait<T: amsg::Wire>(&mut self, promise: Promise<T>) -> Result<T> {
        fail_stop(promise.wait(&mut self.comm).map_err(Error::from))
    }

    /// Allocates from the locale heap.
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let heap = self.heap.as_ref().ok_or(Error::State {
            op: "allocate",
            expected: "active",
        })?;
        Ok(heap.allocate_aligned(size, align)?)
    }

    /// Allocates from the locale heap; exhaustion is fatal.
    pub fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_allocate(size, align) {
            Ok(ptr) => ptr,
            Err(e) => fatal(&e),
        }
    }

    /// Runs handlers and retires finished sends once.
    pub fn progress(&mut self) -> Result<usize> {
        fail_stop(self.comm.try_progress().map_err(Error::from))
    }

    pub fn barrier(&mut self) -> Result<()> {
        fail_stop(self.comm.barrier().map_err(Error::from))
    }

    /// Tears down in reverse order of `activate`. Collective.
    pub fn finish(&mut self) -> Result<()> {
        if self.state == State::Finished {
            return Err(Error::State {
                op: "finish",
                expected: "initializing or active",
            });
        }
        fail_stop(self.tear_down())
    }

    fn tear_down(&mut self) -> Result<()> {
        self.comm.barrier()?;
        self.heap_region = None;
        self.scratch = None;
        if let Some(heap) = self.heap.take() {
            heap.finish()?;
        }
        self.comm.finish()?;
        self.state = State::Finished;
        debug!(core = self.comm.mycore(), stats = ?self.comm.stats(), "runtime finished");
        Ok(())
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mycore(&self) -> Core {
        self.comm.mycore()
    }

    pub fn cores(&self) -> usize {
        self.comm.cores()
    }

    pub fn comm(&self) -> &Communicator<B> {
        &self.comm
    }

    /// Direct access to the communicator, e.g. to register raw handlers
    /// before activation.
    pub fn comm_mut(&mut self) -> &mut Communicator<B> {
        &mut self.comm
    }

    pub fn mesh(&self) -> &Mesh<V> {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut Mesh<V> {
        &mut self.mesh
    }

    pub fn heap(&self) -> Option<&LocaleHeap> {
        self.heap.as_ref()
    }

    /// The RDMA scratch region, once active.
    pub fn scratch(&self) -> Option<&PinnedRegion<V>> {
        self.scratch.as_ref()
    }

    /// The locale heap as a pinned region, once active.
    pub fn heap_region(&self) -> Option<&PinnedRegion<V>> {
        self.heap_region.as_ref()
    }

    /// Scratch region and mesh together, for posting one-sided operations.
    pub fn rdma(&mut self) -> Option<(&PinnedRegion<V>, &mut Mesh<V>)> {
        self.scratch.as_ref().map(|s| (s, &mut self.mesh))
    }

    pub fn delegates(&self) -> &Delegates {
        &self.delegates
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// True on every core when every core passed `ok`.
fn agree<B: Backend>(comm: &mut Communicator<B>, ok: bool) -> amsg::Result<bool> {
    let votes = comm.all_gather(&[u8::from(ok)])?;
    Ok(votes.iter().all(|v| v.first() == Some(&1)))
}
