//! Error types for the pipeline engine.

use thiserror::Error;

/// Exit disposition of a failed subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The process exited with this non-zero status code.
    Code(i32),
    /// The process was terminated by this signal.
    Signal(i32),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Raised by `Pipeline::create_launcher` when the configuration has no
    /// usable runtime (e.g. a missing runtime id).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Wraps an errno-derived filesystem failure (mkdir, file_test, ...).
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// A subprocess failed to spawn.
    #[error("failed to spawn subprocess: {0}")]
    Spawn(std::io::Error),

    /// A subprocess exited with a non-zero status or was killed by a signal.
    #[error("subprocess exited abnormally: {0:?}")]
    ExitFailure(ExitDisposition),

    /// The operation was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// A query-guarded execute was attempted while another was already
    /// queued on the same stage.
    #[error("a build is already in progress for this stage")]
    Pending,

    /// Bad phase flags passed to `attach`/`request_phase`. This is never
    /// propagated as a run failure; callers get the invalid sentinel (`0`)
    /// or a no-op, and the condition is logged via `tracing::warn!`.
    #[error("invalid phase value: {0}")]
    InvalidArgument(String),

    /// Catch-all for stage-defined failures that don't fit the above kinds.
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
