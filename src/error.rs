//! Orchestrator error types.
//!
//! Errors are split by who is expected to act on them:
//!
//! | Category | Variants | Handling |
//! |----------|----------|----------|
//! | **Caller** | `JobNotFound`, `NotCancellable`, `NotRetryable`, `InvalidDraft` | Returned directly |
//! | **Integrity** | `InvalidTransition` | Logged as a defect, never expected |
//! | **Dispatch** | `BackendUnavailable` | Internal, drives re-queue |
//! | **Config** | `Configuration` | Fix configuration at startup |
//!
//! Backend failures use the separate [`BackendError`], classified by
//! [`ErrorKind`] into retryable and non-retryable failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::job::{JobId, JobStatus};

/// Errors returned by the job store and the submission API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    // ── Caller errors ────────────────────────────────────────────────
    /// No job with this id exists, active or archived.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Cancellation requested for a job that is neither queued nor running.
    #[error("Job {job_id} cannot be cancelled in status {status}")]
    NotCancellable { job_id: JobId, status: JobStatus },

    /// Manual retry requested for a job that has not failed.
    #[error("Job {job_id} cannot be retried in status {status}")]
    NotRetryable { job_id: JobId, status: JobStatus },

    /// The submitted draft is missing required fields.
    #[error("Invalid job draft: {0}")]
    InvalidDraft(String),

    // ── Integrity errors ─────────────────────────────────────────────
    /// A status change that the job state machine does not allow.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    // ── Dispatch errors ──────────────────────────────────────────────
    /// Every candidate backend was unavailable for this attempt.
    #[error("No backend available: {0}")]
    BackendUnavailable(String),

    // ── Config errors ────────────────────────────────────────────────
    /// Configuration rejected at startup.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Classification of a backend failure.
///
/// Drives both circuit breaker bookkeeping and retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The attempt exceeded the job's per-attempt timeout.
    Timeout,
    /// Transient backend error (network, overload, internal fault).
    Transient,
    /// The backend refused work or no backend could be reached.
    Unavailable,
    /// Malformed or unsolvable input. Retrying cannot help.
    InvalidInput,
    /// The caller is not allowed to use this backend.
    Unauthorized,
    /// The backend does not implement the requested operation.
    Unsupported,
}

impl ErrorKind {
    /// Returns `true` if a later attempt may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Transient | Self::Unavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::Unavailable => "unavailable",
            Self::InvalidInput => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by a backend's `execute` call.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BackendError {
    // ── Retryable ────────────────────────────────────────────────────
    /// Attempt did not finish within its timeout.
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transient failure inside the backend.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Backend is not accepting work.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    // ── Non-retryable ────────────────────────────────────────────────
    /// Input rejected by the backend's validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller lacks access to the backend.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Operation not implemented by this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// The failure classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Returns `true` if this error is transient and another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
