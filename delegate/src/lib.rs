//! Delegate calls with promises on top of [`amsg`].
//!
//! Operations are registered on every core before the communicator is
//! activated; afterwards any core can [`Delegates::call`] an operation on
//! any core, including itself, and wait on the returned [`Promise`].

pub mod delegates;
pub mod error;
pub mod full_empty;
pub mod promise;

pub use delegates::{DelegateId, DelegateOp, Delegates};
pub use error::{Error, Result};
pub use full_empty::FullEmpty;
pub use promise::Promise;
