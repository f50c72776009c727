//! MPI backend over the world communicator.
//!
//! Non-blocking point-to-point calls go through the raw bindings so the
//! request handle and its buffer can be owned by the communicator's context
//! rings; collectives use the safe rsmpi wrappers.

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;

use ::mpi::collective::{CommunicatorCollectives, SystemOperation};
use ::mpi::datatype::{Equivalence, Partition, PartitionMut};
use ::mpi::environment::Universe;
use ::mpi::ffi;
use ::mpi::raw::AsRaw;
use ::mpi::topology::{Communicator, SimpleCommunicator};
use ::mpi::Count;
use tracing::debug;

use crate::backend::{Backend, Received, Test};
use crate::error::BackendError;
use crate::geometry::Core;

const TAG: c_int = 0;

fn check(op: &'static str, code: c_int) -> Result<(), BackendError> {
    if code == ffi::MPI_SUCCESS as c_int {
        Ok(())
    } else {
        Err(BackendError::new(op, format!("MPI error code {code}")))
    }
}

fn count(op: &'static str, len: usize) -> Result<Count, BackendError> {
    Count::try_from(len).map_err(|_| BackendError::new(op, format!("{len} bytes exceed MPI count range")))
}

/// In-flight `MPI_Isend`. Owns the buffer until completion.
pub struct MpiSend {
    request: ffi::MPI_Request,
    _buf: Box<[u8]>,
}

/// Posted `MPI_Irecv`.
pub struct MpiRecv {
    request: ffi::MPI_Request,
    buf: Box<[u8]>,
}

/// Entered `MPI_Ibarrier`.
pub struct MpiBarrier {
    request: ffi::MPI_Request,
}

/// The world communicator as a [`Backend`].
pub struct MpiBackend {
    world: SimpleCommunicator,
    rank: Core,
    size: usize,
    // Dropped last: finalizes MPI.
    _universe: Option<Universe>,
}

impl MpiBackend {
    /// Initializes MPI and wraps the world communicator.
    pub fn initialize() -> Result<Self, BackendError> {
        let universe = ::mpi::initialize().ok_or_else(|| BackendError::new("init", "MPI already initialized"))?;
        let world = universe.world();
        let mut backend = Self::from_world(world);
        backend._universe = Some(universe);
        Ok(backend)
    }

    /// Wraps an existing communicator; the caller keeps MPI alive.
    pub fn from_world(world: SimpleCommunicator) -> Self {
        let rank = world.rank() as Core;
        let size = world.size() as usize;
        debug!(rank, size, "MPI backend ready");
        Self {
            world,
            rank,
            size,
            _universe: None,
        }
    }

    fn byte_type() -> ffi::MPI_Datatype {
        u8::equivalent_datatype().as_raw()
    }

    fn test_raw(op: &'static str, request: &mut ffi::MPI_Request) -> Result<Option<ffi::MPI_Status>, BackendError> {
        let mut flag: c_int = 0;
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        check(op, unsafe { ffi::MPI_Test(request, &mut flag, status.as_mut_ptr()) })?;
        if flag != 0 {
            Ok(Some(unsafe { status.assume_init() }))
        } else {
            Ok(None)
        }
    }

    fn cancel_raw(op: &'static str, request: &mut ffi::MPI_Request) -> Result<(), BackendError> {
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        unsafe {
            check(op, ffi::MPI_Cancel(request))?;
            check(op, ffi::MPI_Wait(request, status.as_mut_ptr()))
        }
    }
}

impl Backend for MpiBackend {
    type Send = MpiSend;
    type Recv = MpiRecv;
    type Barrier = MpiBarrier;

    fn rank(&self) -> Core {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&mut self, dest: Core, buf: Box<[u8]>) -> Result<MpiSend, BackendError> {
        let n = count("isend", buf.len())?;
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();
        check("isend", unsafe {
            ffi::MPI_Isend(
                buf.as_ptr() as *const c_void,
                n,
                Self::byte_type(),
                dest as c_int,
                TAG,
                self.world.as_raw(),
                request.as_mut_ptr(),
            )
        })?;
        Ok(MpiSend {
            request: unsafe { request.assume_init() },
            _buf: buf,
        })
    }

    fn test_send(&mut self, mut req: MpiSend) -> Result<Test<(), MpiSend>, BackendError> {
        Ok(match Self::test_raw("test_send", &mut req.request)? {
            Some(_) => Test::Complete(()),
            None => Test::Pending(req),
        })
    }

    fn cancel_send(&mut self, mut req: MpiSend) -> Result<(), BackendError> {
        Self::cancel_raw("cancel_send", &mut req.request)
    }

    fn post_recv(&mut self, mut buf: Box<[u8]>) -> Result<MpiRecv, BackendError> {
        let n = count("post_recv", buf.len())?;
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();
        check("post_recv", unsafe {
            ffi::MPI_Irecv(
                buf.as_mut_ptr() as *mut c_void,
                n,
                Self::byte_type(),
                ffi::RSMPI_ANY_SOURCE,
                TAG,
                self.world.as_raw(),
                request.as_mut_ptr(),
            )
        })?;
        Ok(MpiRecv {
            request: unsafe { request.assume_init() },
            buf,
        })
    }

    fn test_recv(&mut self, mut req: MpiRecv) -> Result<Test<Received, MpiRecv>, BackendError> {
        let Some(status) = Self::test_raw("test_recv", &mut req.request)? else {
            return Ok(Test::Pending(req));
        };
        let mut len: c_int = 0;
        check("test_recv", unsafe { ffi::MPI_Get_count(&status, Self::byte_type(), &mut len) })?;
        Ok(Test::Complete(Received {
            source: status.MPI_SOURCE as Core,
            len: len.max(0) as usize,
            buf: req.buf,
        }))
    }

    fn cancel_recv(&mut self, mut req: MpiRecv) -> Result<Box<[u8]>, BackendError> {
        Self::cancel_raw("cancel_recv", &mut req.request)?;
        Ok(req.buf)
    }

    fn barrier(&mut self) -> Result<(), BackendError> {
        self.world.barrier();
        Ok(())
    }

    fn barrier_notify(&mut self) -> Result<MpiBarrier, BackendError> {
        let mut request = MaybeUninit::<ffi::MPI_Request>::uninit();
        check("barrier_notify", unsafe {
            ffi::MPI_Ibarrier(self.world.as_raw(), request.as_mut_ptr())
        })?;
        Ok(MpiBarrier {
            request: unsafe { request.assume_init() },
        })
    }

    fn barrier_try(&mut self, mut req: MpiBarrier) -> Result<Test<(), MpiBarrier>, BackendError> {
        Ok(match Self::test_raw("barrier_try", &mut req.request)? {
            Some(_) => Test::Complete(()),
            None => Test::Pending(req),
        })
    }

    fn all_gather(&mut self, mine: &[u8]) -> Result<Vec<Vec<u8>>, BackendError> {
        let my_len = count("all_gather", mine.len())?;
        let mut counts: Vec<Count> = vec![0; self.size];
        self.world.all_gather_into(&my_len, &mut counts[..]);

        let displs = displacements(&counts);
        let total: usize = counts.iter().map(|&c| c as usize).sum();
        let mut flat = vec![0u8; total];
        {
            let mut partition = PartitionMut::new(&mut flat[..], &counts[..], &displs[..]);
            self.world.all_gather_varcount_into(mine, &mut partition);
        }
        Ok(split(&flat, &counts, &displs))
    }

    fn all_to_all(&mut self, outgoing: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, BackendError> {
        if outgoing.len() != self.size {
            return Err(BackendError::new(
                "all_to_all",
                format!("{} chunks for {} ranks", outgoing.len(), self.size),
            ));
        }
        let send_counts = outgoing
            .iter()
            .map(|c| count("all_to_all", c.len()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut recv_counts: Vec<Count> = vec![0; self.size];
        self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let send_displs = displacements(&send_counts);
        let recv_displs = displacements(&recv_counts);
        let flat_out: Vec<u8> = outgoing.concat();
        let total: usize = recv_counts.iter().map(|&c| c as usize).sum();
        let mut flat_in = vec![0u8; total];
        {
            let partition = Partition::new(&flat_out[..], &send_counts[..], &send_displs[..]);
            let mut partition_in = PartitionMut::new(&mut flat_in[..], &recv_counts[..], &recv_displs[..]);
            self.world.all_to_all_varcount_into(&partition, &mut partition_in);
        }
        Ok(split(&flat_in, &recv_counts, &recv_displs))
    }

    fn all_reduce_max(&mut self, value: u64) -> Result<u64, BackendError> {
        let mut out = 0u64;
        self.world.all_reduce_into(&value, &mut out, SystemOperation::max());
        Ok(out)
    }

    fn all_reduce_min(&mut self, value: u64) -> Result<u64, BackendError> {
        let mut out = 0u64;
        self.world.all_reduce_into(&value, &mut out, SystemOperation::min());
        Ok(out)
    }
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}

fn split(flat: &[u8], counts: &[Count], displs: &[Count]) -> Vec<Vec<u8>> {
    counts
        .iter()
        .zip(displs)
        .map(|(&c, &d)| flat[d as usize..(d + c) as usize].to_vec())
        .collect()
}
