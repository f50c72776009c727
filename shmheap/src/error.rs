//! Error types for the shared heap.

use std::io;

use thiserror::Error;

/// Errors raised by the segment, the managed heap and the chunk allocators.
#[derive(Debug, Error)]
pub enum HeapError {
    /// An OS call (`shm_open`, `ftruncate`, `mmap`, ...) failed.
    #[error("shared memory I/O error: {0}")]
    Io(#[from] io::Error),

    /// The heap could not satisfy a request.
    #[error("out of shared memory: requested {requested} bytes, {free} free, {allocated} allocated by this core")]
    OutOfMemory {
        requested: usize,
        free: usize,
        allocated: usize,
    },

    /// The fixed base address is already mapped in this process by something else.
    #[error("address range {base:#x}+{len:#x} is already in use")]
    AddressInUse { base: usize, len: usize },

    /// The kernel placed the mapping somewhere other than the requested base.
    #[error("segment mapped at {actual:#x}, expected {expected:#x}")]
    MapMismatch { expected: usize, actual: usize },

    /// An attached segment does not carry a formatted heap header.
    #[error("segment {0} does not contain a managed heap")]
    BadMagic(String),

    /// The caller-provided rendezvous (barrier) failed.
    #[error("locale rendezvous failed: {0}")]
    Rendezvous(Box<dyn std::error::Error + Send + Sync>),

    /// Another core of the locale failed to create or attach the heap.
    #[error("a peer in locale {locale} failed to bring up the heap")]
    PeerFailed { locale: usize },

    /// A configuration value is unusable.
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for shared heap operations.
pub type Result<T> = std::result::Result<T, HeapError>;
