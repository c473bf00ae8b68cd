//! Usage and cost accounting.
//!
//! Usage is recorded when a job reaches a terminal state and added to the
//! owner's record for the calendar month (UTC) of that transition. Each
//! terminal transition counts once: recording the same generation twice is
//! a no-op. A job that fails, is retried by hand and then finishes again
//! has a second generation, which only adds the attempts made since the
//! first.

use std::ops::AddAssign;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::{Job, JobId, JobStatus};

/// Consumption attributable to one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageDelta {
    /// Time spent inside backends, in milliseconds.
    pub backend_time_ms: u64,
    /// Measurement operations reported by the backend.
    pub measurements: u64,
    /// 1 for a completed job, 0 otherwise.
    pub successful_jobs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub cost: f64,
}

impl UsageDelta {
    /// Derive the usage of a job from its final snapshot.
    ///
    /// Failed and cancelled jobs still consume backend time and input
    /// bytes; output and measurement counts come only from a result.
    pub fn for_job(job: &Job) -> Self {
        Self::since(job, 0, true)
    }

    /// Usage of the attempts from index `first_attempt` on.
    fn since(job: &Job, first_attempt: usize, count_input: bool) -> Self {
        let result = job.result.as_ref().filter(|_| job.status == JobStatus::Completed);
        let backend_time_ms = job
            .attempts
            .get(first_attempt..)
            .unwrap_or_default()
            .iter()
            .map(|a| a.duration_ms)
            .sum();
        Self {
            backend_time_ms,
            measurements: result.map_or(0, |r| r.measurements),
            successful_jobs: u64::from(job.status == JobStatus::Completed),
            bytes_in: if count_input { job.input_bytes() } else { 0 },
            bytes_out: result.map_or(0, |r| r.output_bytes()),
            cost: if job.status == JobStatus::Completed {
                job.cost_estimate.unwrap_or(0.0)
            } else {
                0.0
            },
        }
    }
}

impl AddAssign for UsageDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.backend_time_ms += rhs.backend_time_ms;
        self.measurements += rhs.measurements;
        self.successful_jobs += rhs.successful_jobs;
        self.bytes_in += rhs.bytes_in;
        self.bytes_out += rhs.bytes_out;
        self.cost += rhs.cost;
    }
}

/// Accumulated usage of one user in one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    /// Calendar month, `YYYY-MM`.
    pub period: String,
    /// Jobs that contributed to this record.
    pub jobs: u64,
    #[serde(flatten)]
    pub totals: UsageDelta,
}

/// Calendar-month period key for `at`.
pub fn period_of(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

#[derive(Debug)]
struct JobUsage {
    generation: u32,
    attempts_counted: usize,
    last_period: String,
    total: UsageDelta,
}

#[derive(Debug, Default)]
struct Ledger {
    records: FxHashMap<(String, String), UsageRecord>,
    by_job: FxHashMap<JobId, JobUsage>,
}

impl Ledger {
    fn apply(
        &mut self,
        job_id: JobId,
        generation: u32,
        attempts_counted: usize,
        user_id: &str,
        at: DateTime<Utc>,
        delta: UsageDelta,
    ) {
        let period = period_of(at);
        let new_in_period = match self.by_job.get_mut(&job_id) {
            Some(usage) => {
                let new_in_period = usage.last_period != period;
                usage.generation = generation;
                usage.attempts_counted = attempts_counted;
                usage.last_period.clone_from(&period);
                usage.total += delta;
                new_in_period
            }
            None => {
                self.by_job.insert(
                    job_id,
                    JobUsage {
                        generation,
                        attempts_counted,
                        last_period: period.clone(),
                        total: delta,
                    },
                );
                true
            }
        };

        let record = self
            .records
            .entry((user_id.to_string(), period.clone()))
            .or_insert_with(|| UsageRecord {
                user_id: user_id.to_string(),
                period,
                jobs: 0,
                totals: UsageDelta::default(),
            });
        if new_in_period {
            record.jobs += 1;
        }
        record.totals += delta;
    }

    fn already_recorded(&self, job_id: JobId, generation: u32) -> bool {
        self.by_job
            .get(&job_id)
            .is_some_and(|usage| usage.generation >= generation)
    }
}

/// Thread-safe usage ledger.
#[derive(Debug, Default)]
pub struct UsageTracker {
    ledger: Mutex<Ledger>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add usage for terminal transition `generation` of a job to its
    /// owner's record for the month of `at`.
    ///
    /// Returns `false` if this generation was already recorded.
    pub fn record(
        &self,
        job_id: JobId,
        generation: u32,
        user_id: &str,
        at: DateTime<Utc>,
        delta: UsageDelta,
    ) -> bool {
        let mut ledger = self.lock();
        if ledger.already_recorded(job_id, generation) {
            debug!(job_id = %job_id, generation, "usage already recorded");
            return false;
        }
        let attempts_counted = ledger.by_job.get(&job_id).map_or(0, |u| u.attempts_counted);
        ledger.apply(job_id, generation, attempts_counted, user_id, at, delta);
        true
    }

    /// Record usage for a job in a terminal state, dated by its last update.
    ///
    /// Only attempts not covered by an earlier generation are charged, and
    /// input bytes are charged once per job.
    pub fn record_job(&self, job: &Job) -> bool {
        let mut ledger = self.lock();
        if ledger.already_recorded(job.id, job.terminal_generation) {
            debug!(job_id = %job.id, generation = job.terminal_generation, "usage already recorded");
            return false;
        }
        let (first_attempt, count_input) = match ledger.by_job.get(&job.id) {
            Some(usage) => (usage.attempts_counted, false),
            None => (0, true),
        };
        let delta = UsageDelta::since(job, first_attempt, count_input);
        ledger.apply(
            job.id,
            job.terminal_generation,
            job.attempts.len(),
            &job.user_id,
            job.updated_at,
            delta,
        );
        true
    }

    /// Usage of `user_id` in `period` (`YYYY-MM`).
    pub fn get(&self, user_id: &str, period: &str) -> Option<UsageRecord> {
        self.lock()
            .records
            .get(&(user_id.to_string(), period.to_string()))
            .cloned()
    }

    /// All records of `user_id`, oldest period first.
    pub fn for_user(&self, user_id: &str) -> Vec<UsageRecord> {
        let mut records: Vec<UsageRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.period.cmp(&b.period));
        records
    }

    /// Total usage recorded for a single job, across generations.
    pub fn for_job(&self, job_id: JobId) -> Option<UsageDelta> {
        self.lock().by_job.get(&job_id).map(|u| u.total)
    }
}
