//! Error types for the RDMA mesh.

use std::io;

use thiserror::Error;

use amsg::Core;

#[derive(Debug, Error)]
pub enum Error {
    /// A verbs call failed.
    #[error("verbs error: {0}")]
    Verbs(#[from] io::Error),

    /// The two-sided transport failed during bootstrap.
    #[error("transport error: {0}")]
    Transport(#[from] amsg::Error),

    #[error("no RDMA device found")]
    NoDevice,

    #[error("port {port} is not active")]
    PortDown { port: u8 },

    /// A peer sent malformed data during connection setup.
    #[error("bootstrap exchange failed: {0}")]
    Bootstrap(String),

    #[error("mesh is already connected")]
    AlreadyConnected,

    #[error("mesh is not connected")]
    NotConnected,

    #[error("core {core} is out of range for a mesh of {cores} cores")]
    InvalidCore { core: Core, cores: usize },

    /// The address range lies outside the pinned region.
    #[error("range {addr:#x}+{len} is outside the pinned region")]
    OutOfRange { addr: usize, len: usize },

    #[error("pinned region: {0}")]
    Pinned(String),
}

pub type Result<T> = std::result::Result<T, Error>;
