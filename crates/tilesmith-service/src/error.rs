use bytes::Bytes;
use thiserror::Error;

/// Rejection returned by a [`DispatchQueue`](crate::dispatch::DispatchQueue) whose backlog is
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue has reached maximum length of {0} and is no longer accepting requests")]
pub struct QueueFull(pub usize);

/// An error that happens while serving a tile or meta request.
///
/// Errors are broadcast to every waiter of a coalesced computation, which is why this type is
/// [`Clone`] and only carries rendered messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TileError {
    /// No generator, factory or pipeline is registered for the requested type.
    #[error("unrecognized {kind} type `{id}`")]
    UnrecognizedType { kind: &'static str, id: String },
    /// The request or the parameters of its generator could not be parsed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Instantiating a generator or batch factory failed.
    #[error("error constructing {id}: {message}")]
    Constructor { id: String, message: String },
    /// The dispatch backlog is exhausted.
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    /// The generation backend failed for this request.
    #[error("generation failed: {0}")]
    Generation(String),
    /// The cache store failed.
    #[error("cache store failed: {0}")]
    Store(String),
    /// The requested item has not been generated yet.
    #[error("not cached")]
    NotCached,
    /// The computation was dropped before it produced a result.
    ///
    /// This usually means the task computing it panicked.
    #[error("computation was abandoned")]
    Abandoned,
}

impl TileError {
    /// Creates a [`Generation`](Self::Generation) error from any error, keeping its full chain.
    pub fn generation(err: impl Into<anyhow::Error>) -> Self {
        Self::Generation(format!("{:#}", err.into()))
    }

    /// Creates a [`Constructor`](Self::Constructor) error for the generator type `id`.
    pub fn constructor(id: &str, err: impl Into<anyhow::Error>) -> Self {
        Self::Constructor {
            id: id.to_owned(),
            message: format!("{:#}", err.into()),
        }
    }

    /// Creates a [`Store`](Self::Store) error and logs it.
    #[track_caller]
    pub fn from_store_error<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "cache store operation failed");
        Self::Store(err.to_string())
    }
}

/// The outcome of a tile or meta computation.
pub type TileResult<T = Bytes> = Result<T, TileError>;
