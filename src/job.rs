//! Job lifecycle types.
//!
//! The job state machine:
//!
//! ```text
//!   submit() ──→ Queued ──→ Running ──→ Completed ──┐
//!                  ↑  │       │  │                   │
//!                  │  │       │  ├──→ Failed ────────┼──→ Archived
//!                  │  │       │  │      │            │
//!                  │  │       │  └──→ Cancelled ─────┘
//!                  │  └───────┼─────────↑
//!                  └──────────┘ (retry with delay)
//! ```
//!
//! **Invariants:**
//! - `submit()` creates jobs in `Queued`.
//! - Transitions only move forward, except `Running → Queued` (automatic
//!   retry) and `Failed → Queued` (manual retry).
//! - `Archived` is permanent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::result::ExecutionResult;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new, time-ordered job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Scheduling priority. Ordered `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the ready queue, possibly behind a retry delay.
    Queued,
    /// Claimed by a dispatch worker.
    Running,
    /// A backend returned a usable result.
    Completed,
    /// Retries exhausted or a non-retryable error was returned.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Moved out of the active store after its retention window.
    Archived,
}

impl JobStatus {
    /// Check if the job is finished from the caller's point of view.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Archived
        )
    }

    /// Check if the job is still pending (queued or running).
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Check if the job completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Queued, Running)
                | (Running, Completed)
                | (Running, Queued)
                | (Running, Failed)
                | (Queued, Cancelled)
                | (Running, Cancelled)
                | (Failed, Queued)
                | (Completed, Archived)
                | (Failed, Archived)
                | (Cancelled, Archived)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "Queued"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
            JobStatus::Cancelled => write!(f, "Cancelled"),
            JobStatus::Archived => write!(f, "Archived"),
        }
    }
}

/// A request to run an optimization, before it becomes a [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDraft {
    /// Owner of the job.
    pub user_id: String,
    /// Operation name understood by the backends (e.g. `"qubo.minimize"`).
    pub operation: String,
    /// Opaque problem payload.
    pub inputs: serde_json::Value,
    /// Caller-supplied idempotency key. Derived from the payload if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Preferred backend id. A hint, not a guarantee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_preference: Option<String>,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,
    /// Per-attempt timeout. The configured default applies if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl JobDraft {
    /// Create a draft with normal priority and no preference.
    pub fn new(
        user_id: impl Into<String>,
        operation: impl Into<String>,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            operation: operation.into(),
            inputs,
            idempotency_key: None,
            backend_preference: None,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    /// Set an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Prefer a specific backend.
    pub fn with_backend_preference(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_preference = Some(backend_id.into());
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// SHA-256 fingerprint of user, operation and inputs, hex encoded.
    ///
    /// `serde_json` maps keep their keys sorted, so equal payloads hash
    /// equally regardless of the order they were built in.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.inputs.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The key used for deduplication.
    pub fn effective_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| self.fingerprint())
    }
}

/// Outcome of a single backend attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
}

/// Record of one backend attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Retry cycle the attempt belonged to (the job's `attempt_count` at the time).
    pub cycle: u32,
    pub backend_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// A unit of optimization work owned by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: String,
    pub user_id: String,
    pub operation: String,
    pub inputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_preference: Option<String>,
    pub priority: Priority,
    /// Maximum wall-clock duration of a single backend attempt.
    pub timeout: Duration,
    pub status: JobStatus,
    /// Number of completed re-queue cycles.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,
    /// Set when cancellation was requested while the job was running.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Times the job entered a terminal state. Above 1 only after a manual retry.
    #[serde(default)]
    pub terminal_generation: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
    /// Submission order, used to break ties within a priority tier.
    #[serde(default)]
    pub(crate) sequence: u64,
}

impl Job {
    pub(crate) fn from_draft(
        draft: JobDraft,
        idempotency_key: String,
        sequence: u64,
        default_timeout: Duration,
        retention: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            idempotency_key,
            user_id: draft.user_id,
            operation: draft.operation,
            inputs: draft.inputs,
            backend_preference: draft.backend_preference,
            priority: draft.priority,
            timeout: draft.timeout.unwrap_or(default_timeout),
            status: JobStatus::Queued,
            attempt_count: 0,
            last_error: None,
            result: None,
            solver_used: None,
            cost_estimate: None,
            cancel_requested: false,
            attempts: Vec::new(),
            terminal_generation: 0,
            created_at: now,
            updated_at: now,
            ttl_expires_at: now
                .checked_add_signed(retention)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            sequence,
        }
    }

    /// Size of the serialized inputs in bytes.
    pub fn input_bytes(&self) -> u64 {
        self.inputs.to_string().len() as u64
    }

    /// Total time spent inside backends across all attempts.
    pub fn backend_time(&self) -> Duration {
        Duration::from_millis(self.attempts.iter().map(|a| a.duration_ms).sum())
    }

    /// Whether the retention window has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Archived.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Queued));
        assert!(Running.can_transition_to(Completed));
        assert!(Failed.can_transition_to(Queued));
        assert!(Completed.can_transition_to(Archived));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Queued));
        assert!(!Archived.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Archived));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = JobDraft::new("alice", "qubo.minimize", serde_json::json!({"q": [1, 2], "n": 2}));
        let b = JobDraft::new("alice", "qubo.minimize", serde_json::json!({"n": 2, "q": [1, 2]}));
        let c = JobDraft::new("bob", "qubo.minimize", serde_json::json!({"n": 2, "q": [1, 2]}));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_explicit_key_wins() {
        let draft = JobDraft::new("alice", "op", serde_json::json!({})).with_idempotency_key("k-1");
        assert_eq!(draft.effective_key(), "k-1");
    }

    #[test]
    fn test_job_id_roundtrip_str() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
