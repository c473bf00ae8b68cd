//! Job store and priority ready queue.
//!
//! The store exclusively owns every [`Job`]. Callers get snapshots; all
//! mutation goes through single-call operations that take one lock, so
//! each operation is atomic and no caller ever holds the lock across a
//! suspension point.
//!
//! ## Queueing
//!
//! - Eligible jobs sit in a max-heap ordered by priority, then by
//!   submission sequence (FIFO within a tier).
//! - Jobs re-queued with a retry delay wait in a second heap ordered by
//!   their eligibility instant and are promoted when it passes.
//! - Cancelled jobs are removed lazily: a popped entry whose job is no
//!   longer `Queued` is skipped.
//! - A pop marks the job `Running` under the same lock, so a job is never
//!   delivered to two workers.
//!
//! ## Idempotency
//!
//! `submit` checks the idempotency key and inserts under one lock. Keys
//! are scoped to the submitting user, and a key stays bound to its job
//! until the job is archived.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};
use crate::job::{AttemptRecord, Job, JobDraft, JobId, JobStatus, Priority};
use crate::result::ExecutionResult;

/// Outcome of [`JobStore::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    /// `true` when the idempotency key already mapped to this job.
    pub replayed: bool,
}

/// A job handed to a dispatch worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Snapshot taken when the job moved to `Running`.
    pub job: Job,
    /// Fired when cancellation of this job is requested.
    pub cancel: CancellationToken,
}

/// A validated status change with the fields it writes.
#[derive(Debug, Clone)]
pub enum JobTransition {
    /// `Running → Completed`.
    Complete {
        result: ExecutionResult,
        solver_used: String,
        cost_estimate: f64,
    },
    /// `Running → Queued`, eligible again after `delay`.
    Requeue { delay: Duration, error: String },
    /// `Running → Failed`.
    Fail { error: String },
    /// `Queued | Running → Cancelled`.
    Cancel,
    /// `Failed → Queued`, keeping `attempt_count`.
    Retry,
    /// `Completed | Failed | Cancelled → Archived`.
    Archive,
}

impl JobTransition {
    /// Status this transition moves the job to.
    pub fn target(&self) -> JobStatus {
        match self {
            Self::Complete { .. } => JobStatus::Completed,
            Self::Requeue { .. } | Self::Retry => JobStatus::Queued,
            Self::Fail { .. } => JobStatus::Failed,
            Self::Cancel => JobStatus::Cancelled,
            Self::Archive => JobStatus::Archived,
        }
    }
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs in this status. `Some(Archived)` implies `include_archived`.
    pub status: Option<JobStatus>,
    /// Include archived jobs. Off by default.
    pub include_archived: bool,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn including_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
    }
}

/// Queued jobs per priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }

    fn bump(&mut self, priority: Priority) {
        match priority {
            Priority::Urgent => self.urgent += 1,
            Priority::High => self.high += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: Priority,
    sequence: u64,
    job_id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    eligible_at: Instant,
    sequence: u64,
    job_id: JobId,
}

#[derive(Debug)]
struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: FxHashMap<JobId, JobEntry>,
    /// Idempotency keys, scoped by owner.
    keys: FxHashMap<(String, String), JobId>,
    archived: FxHashMap<JobId, Job>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    next_sequence: u64,
}

impl StoreState {
    fn push_ready(&mut self, job: &Job) {
        self.ready.push(ReadyEntry {
            priority: job.priority,
            sequence: job.sequence,
            job_id: job.id,
        });
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some(Reverse(entry)) = self.delayed.peek() {
            if entry.eligible_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.delayed.pop() else {
                break;
            };
            let queued = self
                .jobs
                .get(&entry.job_id)
                .filter(|job_entry| job_entry.job.status == JobStatus::Queued)
                .map(|job_entry| job_entry.job.priority);
            if let Some(priority) = queued {
                self.ready.push(ReadyEntry {
                    priority,
                    sequence: entry.sequence,
                    job_id: entry.job_id,
                });
            }
        }
    }

    fn claim_next(&mut self, now: Instant) -> Option<ClaimedJob> {
        self.promote_delayed(now);
        while let Some(entry) = self.ready.pop() {
            let Some(job_entry) = self.jobs.get_mut(&entry.job_id) else {
                continue;
            };
            if job_entry.job.status != JobStatus::Queued {
                continue;
            }
            job_entry.job.status = JobStatus::Running;
            job_entry.job.updated_at = Utc::now();
            return Some(ClaimedJob {
                job: job_entry.job.clone(),
                cancel: job_entry.cancel.clone(),
            });
        }
        None
    }

    fn next_eligible_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(entry)| entry.eligible_at)
    }

    fn archive(&mut self, job_id: JobId) -> Option<Job> {
        let entry = self.jobs.remove(&job_id)?;
        let mut job = entry.job;
        let scoped = (job.user_id.clone(), job.idempotency_key.clone());
        if self.keys.get(&scoped) == Some(&job_id) {
            self.keys.remove(&scoped);
        }
        job.status = JobStatus::Archived;
        job.updated_at = Utc::now();
        self.archived.insert(job_id, job.clone());
        Some(job)
    }
}

/// In-memory job store with a priority ready queue.
#[derive(Debug)]
pub struct JobStore {
    state: Mutex<StoreState>,
    notify: Notify,
    retention: chrono::Duration,
    default_timeout: Duration,
}

impl JobStore {
    /// Create a store whose jobs expire `retention` after creation.
    pub fn new(retention: Duration, default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            notify: Notify::new(),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            default_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept a draft, or return the job its idempotency key already maps to.
    pub fn submit(&self, draft: JobDraft) -> Submission {
        let key = draft.effective_key();
        let scoped = (draft.user_id.clone(), key.clone());
        let mut state = self.lock();

        if let Some(existing) = state.keys.get(&scoped).and_then(|id| state.jobs.get(id)) {
            debug!(job_id = %existing.job.id, "idempotent replay of existing job");
            return Submission {
                job: existing.job.clone(),
                replayed: true,
            };
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let job = Job::from_draft(draft, key, sequence, self.default_timeout, self.retention);
        state.keys.insert(scoped, job.id);
        state.push_ready(&job);
        state.jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                cancel: CancellationToken::new(),
            },
        );
        drop(state);

        self.notify.notify_one();
        info!(
            job_id = %job.id,
            user = %job.user_id,
            priority = %job.priority,
            "job queued"
        );
        Submission {
            job,
            replayed: false,
        }
    }

    /// Claim the next eligible job without waiting.
    pub fn try_next_ready(&self) -> Option<ClaimedJob> {
        self.lock().claim_next(Instant::now())
    }

    /// Wait for the highest-priority eligible job and mark it `Running`.
    ///
    /// Returns `None` once `shutdown` is cancelled.
    pub async fn next_ready(&self, shutdown: &CancellationToken) -> Option<ClaimedJob> {
        loop {
            // Created before checking the queue so a push in between is not missed.
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.lock();
                if let Some(claimed) = state.claim_next(Instant::now()) {
                    return Some(claimed);
                }
                state.next_eligible_at()
            };

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Apply a validated status change and return the updated job.
    pub fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job> {
        let mut state = self.lock();
        let target = transition.target();

        let from = match state.jobs.get(&job_id) {
            Some(entry) => entry.job.status,
            None => {
                return Err(match state.archived.get(&job_id) {
                    Some(job) => invalid_transition(job_id, job.status, target),
                    None => OrchestratorError::JobNotFound(job_id),
                });
            }
        };
        if !from.can_transition_to(target) {
            return Err(invalid_transition(job_id, from, target));
        }

        if let JobTransition::Archive = transition {
            return state
                .archive(job_id)
                .ok_or(OrchestratorError::JobNotFound(job_id));
        }

        let now = Utc::now();
        let mut requeue_at = None;
        let mut ready = false;
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return Err(OrchestratorError::JobNotFound(job_id));
        };
        let job = &mut entry.job;
        job.status = target;
        job.updated_at = now;
        if matches!(target, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled) {
            job.terminal_generation += 1;
        }

        match transition {
            JobTransition::Complete {
                result,
                solver_used,
                cost_estimate,
            } => {
                job.result = Some(result);
                job.solver_used = Some(solver_used);
                job.cost_estimate = Some(cost_estimate);
            }
            JobTransition::Requeue { delay, error } => {
                job.attempt_count = job.attempt_count.saturating_add(1);
                job.last_error = Some(error);
                requeue_at = Some(Instant::now() + delay);
            }
            JobTransition::Fail { error } => {
                job.last_error = Some(error);
            }
            JobTransition::Cancel => {
                job.cancel_requested = true;
                entry.cancel.cancel();
            }
            JobTransition::Retry => ready = true,
            JobTransition::Archive => {}
        }

        let job = entry.job.clone();
        if let Some(eligible_at) = requeue_at {
            state.delayed.push(Reverse(DelayedEntry {
                eligible_at,
                sequence: job.sequence,
                job_id,
            }));
        } else if ready {
            state.push_ready(&job);
        }
        drop(state);

        if requeue_at.is_some() {
            // Idle workers recompute their wake-up deadline.
            self.notify.notify_waiters();
        } else if ready {
            self.notify.notify_one();
        }
        debug!(job_id = %job_id, from = %from, to = %target, "job transition");
        Ok(job)
    }

    /// Append an attempt record to a job's history.
    pub fn record_attempt(&self, job_id: JobId, attempt: AttemptRecord) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        entry.job.attempts.push(attempt);
        entry.job.updated_at = Utc::now();
        Ok(())
    }

    /// Cancel a job.
    ///
    /// A queued job becomes `Cancelled` immediately and will never be
    /// dispatched. A running job keeps running: its cancellation flag is
    /// set and its token fired, and the dispatcher moves it to `Cancelled`
    /// at its next decision point.
    pub fn cancel(&self, job_id: JobId) -> Result<Job> {
        let mut state = self.lock();
        if let Some(job) = state.archived.get(&job_id) {
            return Err(OrchestratorError::NotCancellable {
                job_id,
                status: job.status,
            });
        }
        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        match entry.job.status {
            JobStatus::Queued => {
                entry.job.status = JobStatus::Cancelled;
                entry.job.terminal_generation += 1;
                entry.job.cancel_requested = true;
                entry.job.updated_at = Utc::now();
                entry.cancel.cancel();
                info!(job_id = %job_id, "cancelled queued job");
            }
            JobStatus::Running => {
                entry.job.cancel_requested = true;
                entry.job.updated_at = Utc::now();
                entry.cancel.cancel();
                info!(job_id = %job_id, "cancellation requested for running job");
            }
            status => return Err(OrchestratorError::NotCancellable { job_id, status }),
        }
        Ok(entry.job.clone())
    }

    /// Put a failed job back in the queue, keeping its history.
    pub fn retry(&self, job_id: JobId) -> Result<Job> {
        let status = self.get(job_id)?.status;
        if status != JobStatus::Failed {
            return Err(OrchestratorError::NotRetryable { job_id, status });
        }
        match self.transition(job_id, JobTransition::Retry) {
            // Lost a race with the sweeper.
            Err(OrchestratorError::InvalidTransition { from, .. }) => {
                Err(OrchestratorError::NotRetryable {
                    job_id,
                    status: from,
                })
            }
            other => other,
        }
    }

    /// Snapshot of a job, active or archived.
    pub fn get(&self, job_id: JobId) -> Result<Job> {
        let state = self.lock();
        state
            .jobs
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .or_else(|| state.archived.get(&job_id).cloned())
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// Jobs owned by `user_id`, oldest first.
    pub fn list(&self, user_id: &str, filter: &JobFilter) -> Vec<Job> {
        let include_archived =
            filter.include_archived || filter.status == Some(JobStatus::Archived);
        let state = self.lock();

        let active = state.jobs.values().map(|entry| &entry.job);
        let archived = state
            .archived
            .values()
            .filter(|_| include_archived);
        let mut jobs: Vec<Job> = active
            .chain(archived)
            .filter(|job| job.user_id == user_id && filter.matches(job))
            .cloned()
            .collect();
        drop(state);

        jobs.sort_by_key(|job| (job.created_at, job.sequence));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Archive every terminal job whose retention window ended by `now`.
    pub fn archive_expired(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut state = self.lock();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|entry| {
                matches!(
                    entry.job.status,
                    JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
                ) && entry.job.is_expired(now)
            })
            .map(|entry| entry.job.id)
            .collect();
        for job_id in &expired {
            state.archive(*job_id);
        }
        expired
    }

    /// Queued jobs per priority tier, including those waiting out a delay.
    pub fn queue_depth(&self) -> QueueDepth {
        let state = self.lock();
        let mut depth = QueueDepth::default();
        for entry in state.jobs.values() {
            if entry.job.status == JobStatus::Queued {
                depth.bump(entry.job.priority);
            }
        }
        depth
    }

    /// Number of jobs in the active store.
    pub fn active_len(&self) -> usize {
        self.lock().jobs.len()
    }
}

fn invalid_transition(job_id: JobId, from: JobStatus, to: JobStatus) -> OrchestratorError {
    error!(
        job_id = %job_id,
        from = %from,
        to = %to,
        "rejected invalid job transition; state machine contract violated"
    );
    OrchestratorError::InvalidTransition { job_id, from, to }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
