use thiserror::Error;
use uuid::Uuid;

use crate::models::JobStatus;

/// Failures raised by the render backend adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("submission failed: {0}")]
    Submission(String),

    #[error("backend did not finish {handle} within {seconds}s")]
    Timeout { handle: String, seconds: u64 },

    #[error("backend rendering failed: {0}")]
    Execution(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {status} and cannot change to {requested}")]
    InvalidState {
        id: Uuid,
        status: JobStatus,
        requested: JobStatus,
    },

    #[error("job {id} has no result while {status}")]
    ResultUnavailable { id: Uuid, status: JobStatus },

    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("job {0} already exists")]
    DuplicateId(Uuid),

    #[error("job queue is closed")]
    QueueClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Outcome of a single failed pipeline attempt; the worker decides what to do
/// with it instead of catching errors.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    /// Eligible for another attempt while the retry budget lasts.
    #[error(transparent)]
    Recoverable(#[from] BackendError),

    #[error("{0}")]
    Terminal(String),

    /// The job was cancelled while the attempt was in flight.
    #[error("cancelled")]
    Cancelled,
}
