use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the facade, the session, the dispatcher and the pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Model file unreadable, or rejected by the backend that claimed it.
    #[error("failed to load model at {path}: {reason}")]
    LoadFailed { path: PathBuf, reason: String },

    /// No backend identified the model header and no fallback is registered.
    #[error("no backend matched the model file header")]
    NoBackend,

    /// The backend returned an error from a token-evaluation call.
    #[error("token evaluation failed: {0}")]
    EvalFailed(String),

    /// The snapshot was taken from a different session.
    #[error("snapshot does not match this session")]
    SnapshotMismatch,

    /// A deserialized stream was produced under a different context size.
    #[error("context size mismatch: session has {session}, stream carries {stream}")]
    ContextMismatch { session: u32, stream: u32 },

    /// Read or write failure while persisting or restoring state.
    #[error("serialization I/O failed: {0}")]
    SerializationIo(#[from] io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Pool lookup for an id with neither a resident slot nor a slot file.
    #[error("no resident session or slot file for id {0}")]
    NotFound(u64),
}

impl Error {
    pub(crate) fn invalid_data(reason: impl Into<String>) -> Self {
        Error::SerializationIo(io::Error::new(io::ErrorKind::InvalidData, reason.into()))
    }
}
