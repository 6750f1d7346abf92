//! Typed error model shared by all filesystem backends.
//!
//! Every operation returns one of a fixed set of status kinds. The retry
//! decorator classifies failures by [`ErrorKind`], so the kind is part of
//! the contract, not just diagnostics.

/// Status kind of an [`Error`], used for retriable-error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    OutOfRange,
    FailedPrecondition,
    Internal,
    Unavailable,
    DeadlineExceeded,
    Unknown,
    Aborted,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed input, e.g. a path that does not parse. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The object or bucket does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// A ranged read past the end of the object.
    #[error("Out of range: {0}")]
    OutOfRange(String),
    /// The operation is not valid in the handle's current state.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),
    /// A local failure, or a condition expected to clear on its own.
    #[error("Internal: {0}")]
    Internal(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// A server or transport error outside the mapped set, preserving the
    /// underlying error name and message.
    #[error("Unknown: {0}")]
    Unknown(String),
    /// The retry envelope gave up; carries the final attempt's failure.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Aborted(_) => ErrorKind::Aborted,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
