//! Error types for the two-sided transport.

use thiserror::Error;

use crate::codec::CodecError;
use crate::communicator::Phase;
use crate::geometry::Core;
use crate::handler::HandlerId;

/// Failure reported by a [`Backend`](crate::backend::Backend) call.
#[derive(Debug, Error)]
#[error("{op} failed: {message}")]
pub struct BackendError {
    /// Name of the failing operation (`isend`, `barrier`, ...).
    pub op: &'static str,
    pub message: String,
}

impl BackendError {
    pub fn new(op: &'static str, message: impl Into<String>) -> Self {
        Self {
            op,
            message: message.into(),
        }
    }
}

/// Two-sided transport errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The operation is not allowed in the communicator's current phase.
    #[error("{op} is not allowed in phase {phase:?}")]
    Phase { op: &'static str, phase: Phase },

    /// No site adapter recognized the launcher environment.
    #[error("no site adapter reported locale geometry")]
    NoSiteAdapter,

    /// A site adapter found its variables but could not parse them.
    #[error("site adapter {adapter}: {message}")]
    Site { adapter: &'static str, message: String },

    /// Locales report different core counts.
    #[error("locales disagree on core count (min {min}, max {max})")]
    LocaleSizeMismatch { min: usize, max: usize },

    /// Cores of a locale are not numbered contiguously.
    #[error("core {core} reports local rank {reported}, contiguous layout requires {expected}")]
    NonContiguousLayout {
        core: Core,
        reported: usize,
        expected: usize,
    },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("message of {len} bytes exceeds the {max}-byte receive buffer")]
    MessageTooLarge { len: usize, max: usize },

    #[error("no handler registered under {0:?}")]
    UnknownHandler(HandlerId),

    #[error("core {core} is out of range for a job of {cores} cores")]
    InvalidCore { core: Core, cores: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A handler reported a failure of its own.
    #[error("handler {handler:?} failed: {message}")]
    Handler { handler: HandlerId, message: String },
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
