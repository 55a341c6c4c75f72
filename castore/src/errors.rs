use thiserror::Error;
use tonic::Status;

/// Errors of the content-addressed storage layer and its consumers.
///
/// These are kinds, not precise types: `NotFound` lets callers decide
/// between fallback and surfacing, `Locked` is retried with bounded
/// back-off, everything else is surfaced.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced digest, commit, tree or blob is absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Malformed serialized protobuf or Git object; always surfaced.
    #[error("parse error: {0}")]
    Parse(String),

    /// Filesystem or network I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient lock contention.
    #[error("lock contention: {0}")]
    Locked(String),

    /// Hash mode mismatch, upwards symlink, or missing capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Internal invariant violation.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Error::Locked(_))
    }
}

impl From<Error> for Status {
    fn from(value: Error) -> Self {
        match value {
            Error::NotFound(msg) => Status::not_found(msg),
            Error::Unsupported(msg) => Status::failed_precondition(msg),
            err => Status::internal(err.to_string()),
        }
    }
}
