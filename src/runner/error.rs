//! Runner error types.

use thiserror::Error;

/// Errors from the runner's subprocess and inference path.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The inference server could not be launched.
    #[error("failed to start inference server: {0}")]
    StartFailed(String),

    /// The inference server never answered its readiness probe.
    #[error("timed out waiting for inference server to become ready")]
    ReadinessTimeout,

    /// An HTTP call against the local inference server failed.
    #[error("inference API request failed: {0}")]
    Api(#[from] reqwest::Error),

    /// The inference server returned a non-success status.
    #[error("inference API returned {status}: {body}")]
    ApiStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The subprocess exited while work was in flight.
    #[error("inference server exited: {0}")]
    ServerExited(String),

    /// No subprocess was ever started.
    #[error("no inference server process to stop")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// True when the local server refused the connection outright.
    ///
    /// The instance escalates this to a host-process exit: the
    /// subprocess is effectively dead and an external supervisor
    /// restart is the recovery path.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, RunnerError::Api(err) if err.is_connect())
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
