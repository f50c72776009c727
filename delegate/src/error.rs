use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] amsg::Error),

    #[error("cannot decode delegate response: {0}")]
    Codec(#[from] amsg::CodecError),

    /// The promise's value was already taken.
    #[error("promise already consumed")]
    Consumed,
}

pub type Result<T> = std::result::Result<T, Error>;
