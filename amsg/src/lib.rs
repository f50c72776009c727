//! Two-sided active messages over a message-passing backend.
//!
//! Every core runs one [`Communicator`]. Messages name a handler registered
//! in the same order on every core; the receiving core runs that handler
//! when it polls. Sends and receives draw on two separate fixed-size
//! context rings, and the receive ring is re-armed as it drains so it never
//! runs dry.
//!
//! Two backends are provided: [`local::LocalFabric`] (one thread per core)
//! and, with the `mpi` feature, [`mpi::MpiBackend`].

pub mod backend;
pub mod codec;
pub mod communicator;
pub mod config;
pub mod context;
pub mod error;
pub mod geometry;
pub mod handler;
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod site;

pub use backend::{Backend, Received, Test};
pub use codec::{CodecError, Wire};
pub use communicator::{Collectives, Communicator, Outbox, Phase, Stats};
pub use config::CommConfig;
pub use error::{BackendError, Error, Result};
pub use geometry::{Core, Geometry, Locale};
pub use handler::{HandlerId, MessageId};
pub use local::{LocalBackend, LocalFabric};
pub use site::{Environment, Fixed, ProcessEnv, SiteAdapter, SiteGeometry, default_adapters};
