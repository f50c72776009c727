use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] amsg::Error),

    #[error(transparent)]
    Rdma(#[from] rcmesh::Error),

    #[error(transparent)]
    Heap(#[from] shmheap::HeapError),

    #[error(transparent)]
    Delegate(#[from] delegate::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The runtime is not in the state the operation needs.
    #[error("{op} requires an {expected} runtime")]
    State { op: &'static str, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure belongs to the job rather than to the caller.
    ///
    /// Misuse (wrong lifecycle state, bad arguments, bad configuration) is
    /// returned to the caller; everything else ends the job.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(e) | Error::Delegate(delegate::Error::Transport(e)) => transport_is_fatal(e),
            Error::Rdma(e) => !matches!(
                e,
                rcmesh::Error::AlreadyConnected
                    | rcmesh::Error::NotConnected
                    | rcmesh::Error::InvalidCore { .. }
                    | rcmesh::Error::OutOfRange { .. }
            ),
            Error::Heap(_) => true,
            Error::Delegate(e) => !matches!(e, delegate::Error::Consumed),
            Error::Config(_) | Error::State { .. } => false,
        }
    }
}

fn transport_is_fatal(e: &amsg::Error) -> bool {
    !matches!(
        e,
        amsg::Error::Phase { .. }
            | amsg::Error::InvalidCore { .. }
            | amsg::Error::MessageTooLarge { .. }
            | amsg::Error::Config(_)
    )
}

/// Logs `err` and terminates the process with a failure status.
///
/// The job is fail-stop: every transport, heap or geometry failure ends
/// up here.
pub fn fatal(err: &Error) -> ! {
    if let Error::Heap(shmheap::HeapError::OutOfMemory {
        requested,
        free,
        allocated,
    }) = err
    {
        tracing::error!(requested, free, allocated, "shared heap exhausted");
    }
    tracing::error!(error = %err, "fatal runtime error, aborting");
    std::process::abort()
}

/// Returns misuse errors to the caller and ends the job on anything else.
pub(crate) fn fail_stop<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) if e.is_fatal() => fatal(&e),
        other => other,
    }
}
