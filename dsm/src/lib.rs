//! Runtime context for a distributed shared-memory job.
//!
//! [`Runtime`] owns one core's two-sided communicator, RDMA mesh, locale
//! heap and delegate table, and replaces process-wide globals with an
//! explicit value driven through `init`, `activate` and `finish`.

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result, fatal};
pub use runtime::{Runtime, State};

/// MPI for the two-sided path, libibverbs for the one-sided path.
#[cfg(all(feature = "mpi", feature = "ibverbs"))]
pub type HardwareRuntime = Runtime<amsg::mpi::MpiBackend, rcmesh::IbVerbs>;
