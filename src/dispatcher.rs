//! Dispatcher and worker pool.
//!
//! Each worker loops on [`JobStore::next_ready`] and runs one job at a
//! time through [`Dispatcher::process`]:
//!
//! ```text
//!   claim ──→ cancelled? ──→ candidates ──→ for each candidate:
//!                                             cancelled? → Cancelled
//!                                             breaker admits? else skip
//!                                             execute (bounded by job.timeout)
//!                                               ok            → Completed
//!                                               retryable     → next candidate
//!                                               (timeouts and panics are retryable)
//!                                               non-retryable → Failed
//!             exhausted ──→ cancelled? ──→ should_retry? → Queued (+delay)
//!                                                    else → Failed
//! ```
//!
//! Terminal transitions record usage and emit provenance. A job is only
//! ever seen by one worker; the store marks it running as it is popped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, ExecutionRequest};
use crate::breaker::CircuitBreakerRegistry;
use crate::error::{BackendError, ErrorKind, OrchestratorError, Result};
use crate::job::{AttemptOutcome, AttemptRecord, Job, JobId, JobStatus};
use crate::provenance::{ProvenanceEntry, ProvenanceSink};
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use crate::store::{ClaimedJob, JobStore, JobTransition};
use crate::usage::UsageTracker;

/// Counters maintained by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    processed: AtomicU64,
    attempts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    /// Jobs claimed from the queue, counting each retry cycle.
    pub processed: u64,
    /// Backend attempts made.
    pub attempts: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub requeued: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Moves claimed jobs through backend attempts to their next state.
pub struct Dispatcher {
    store: Arc<JobStore>,
    registry: Arc<BackendRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    selector: BackendSelector,
    retry: RetryPolicy,
    usage: Arc<UsageTracker>,
    provenance: Arc<dyn ProvenanceSink>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<BackendRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        selector: BackendSelector,
        retry: RetryPolicy,
        usage: Arc<UsageTracker>,
        provenance: Arc<dyn ProvenanceSink>,
    ) -> Self {
        Self {
            store,
            registry,
            breakers,
            selector,
            retry,
            usage,
            provenance,
            stats: DispatcherStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Worker loop. Runs until `shutdown` fires.
    ///
    /// A job being processed when shutdown fires is finished first.
    pub async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        info!(worker, "dispatch worker started");
        while let Some(claimed) = self.store.next_ready(&shutdown).await {
            let job_id = claimed.job.id;
            match self.process(claimed).await {
                Ok(status) => debug!(worker, job_id = %job_id, status = %status, "job processed"),
                Err(e) => error!(worker, job_id = %job_id, error = %e, "job processing aborted"),
            }
        }
        info!(worker, "dispatch worker stopped");
    }

    /// Run one claimed job and return the status it was left in.
    pub async fn process(&self, claimed: ClaimedJob) -> Result<JobStatus> {
        let ClaimedJob { job, cancel } = claimed;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.id, attempt = job.attempt_count, "processing job");

        if cancel.is_cancelled() {
            return self.finish_cancelled(job.id).await;
        }

        let candidates = self.selector.select_candidates(&job);
        let mut last_failure = None;
        if candidates.is_empty() {
            let err = OrchestratorError::BackendUnavailable(format!(
                "no backend can take operation {}",
                job.operation
            ));
            warn!(job_id = %job.id, error = %err, "no candidate backends");
            last_failure = Some((ErrorKind::Unavailable, err.to_string()));
        }

        for backend_id in &candidates {
            if cancel.is_cancelled() {
                return self.finish_cancelled(job.id).await;
            }
            let Some(backend) = self.registry.get(backend_id) else {
                continue;
            };
            if !self.breakers.is_available(backend_id) {
                debug!(job_id = %job.id, backend = %backend_id, "breaker refused attempt");
                last_failure.get_or_insert_with(|| {
                    (ErrorKind::Unavailable, format!("{backend_id}: circuit open"))
                });
                continue;
            }

            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            let request = ExecutionRequest::for_job(&job);
            let started_at = Utc::now();
            let start = Instant::now();
            // Run on its own task so a panicking backend costs one attempt, not the worker.
            let mut handle = tokio::spawn({
                let backend = backend.clone();
                async move { backend.execute(&request).await }
            });
            let outcome = match tokio::time::timeout(job.timeout, &mut handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => {
                    error!(job_id = %job.id, backend = %backend_id, error = %join_err, "backend task aborted");
                    Err(BackendError::Transient(format!(
                        "backend panicked: {}",
                        panic_message(join_err)
                    )))
                }
                Err(_) => {
                    handle.abort();
                    Err(BackendError::Timeout(job.timeout))
                }
            };
            let elapsed = start.elapsed();
            let mut attempt = AttemptRecord {
                cycle: job.attempt_count,
                backend_id: backend_id.clone(),
                started_at,
                duration_ms: elapsed.as_millis() as u64,
                outcome: AttemptOutcome::Succeeded,
            };

            match outcome {
                Ok(result) => {
                    self.breakers.record_success(backend_id);
                    self.note_attempt(job.id, attempt);
                    let cost_estimate = result
                        .reported_cost
                        .unwrap_or_else(|| backend.capabilities().estimate_cost(elapsed));
                    let done = self.store.transition(
                        job.id,
                        JobTransition::Complete {
                            result,
                            solver_used: backend_id.clone(),
                            cost_estimate,
                        },
                    )?;
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        job_id = %job.id,
                        backend = %backend_id,
                        attempt = job.attempt_count,
                        duration_ms = attempt_ms(elapsed),
                        "job completed"
                    );
                    self.finalize(&done).await;
                    return Ok(JobStatus::Completed);
                }
                Err(err) => {
                    let kind = err.kind();
                    let message = format!("{backend_id}: {err}");
                    attempt.outcome = AttemptOutcome::Failed {
                        kind,
                        message: err.to_string(),
                    };

                    if !kind.is_retryable() {
                        // The input is at fault, not the backend.
                        self.breakers.release(backend_id);
                        self.note_attempt(job.id, attempt);
                        warn!(job_id = %job.id, backend = %backend_id, error = %err, "non-retryable failure");
                        return self.finish_failed(job.id, message).await;
                    }

                    self.breakers.record_failure(backend_id);
                    self.note_attempt(job.id, attempt);
                    warn!(
                        job_id = %job.id,
                        backend = %backend_id,
                        attempt = job.attempt_count,
                        kind = %kind,
                        error = %err,
                        "attempt failed, trying next candidate"
                    );
                    last_failure = Some((kind, message));
                }
            }
        }

        if cancel.is_cancelled() {
            return self.finish_cancelled(job.id).await;
        }

        let (kind, error) = last_failure
            .unwrap_or_else(|| (ErrorKind::Unavailable, "no backend admitted the job".into()));
        if self.retry.should_retry(job.attempt_count, kind) {
            let delay = self.retry.compute_delay(job.attempt_count);
            self.store
                .transition(job.id, JobTransition::Requeue { delay, error })?;
            self.stats.requeued.fetch_add(1, Ordering::Relaxed);
            info!(
                job_id = %job.id,
                attempt = job.attempt_count + 1,
                delay_ms = attempt_ms(delay),
                "job re-queued"
            );
            Ok(JobStatus::Queued)
        } else {
            warn!(job_id = %job.id, attempt = job.attempt_count, "retries exhausted");
            self.finish_failed(job.id, error).await
        }
    }

    async fn finish_failed(&self, job_id: JobId, error: String) -> Result<JobStatus> {
        let job = self.store.transition(job_id, JobTransition::Fail { error })?;
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            job_id = %job_id,
            error = job.last_error.as_deref().unwrap_or_default(),
            "job failed"
        );
        self.finalize(&job).await;
        Ok(JobStatus::Failed)
    }

    async fn finish_cancelled(&self, job_id: JobId) -> Result<JobStatus> {
        let job = self.store.transition(job_id, JobTransition::Cancel)?;
        self.stats.record_cancelled();
        info!(job_id = %job_id, "job cancelled at decision point");
        self.finalize(&job).await;
        Ok(JobStatus::Cancelled)
    }

    /// Append an attempt to the job's history.
    ///
    /// Breaker state for the attempt is settled before this runs, so a store
    /// error here is logged rather than aborting the job.
    fn note_attempt(&self, job_id: JobId, attempt: AttemptRecord) {
        if let Err(e) = self.store.record_attempt(job_id, attempt) {
            warn!(job_id = %job_id, error = %e, "failed to record attempt");
        }
    }

    /// Record usage and provenance for a job that reached a terminal state.
    pub(crate) async fn finalize(&self, job: &Job) {
        self.usage.record_job(job);
        let Some(entry) = ProvenanceEntry::for_job(job) else {
            return;
        };
        if let Err(e) = self.provenance.record(entry).await {
            warn!(job_id = %job.id, error = %e, "failed to record provenance");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("selector", &self.selector)
            .field("retry", &self.retry)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

fn attempt_ms(d: std::time::Duration) -> u64 {
    d.as_millis() as u64
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::capability::Capabilities;
    use crate::error::BackendResult;
    use crate::job::JobDraft;
    use crate::provenance::{MemoryProvenanceSink, ProvenanceOutcome};
    use crate::result::ExecutionResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend that replays a script of outcomes, then succeeds.
    struct Scripted {
        id: String,
        capabilities: Capabilities,
        script: Mutex<VecDeque<BackendResult<ExecutionResult>>>,
        calls: AtomicU64,
        delay: Duration,
    }

    impl Scripted {
        fn new(id: &str, script: Vec<BackendResult<ExecutionResult>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                capabilities: Capabilities::classical(id),
                script: Mutex::new(script.into()),
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn id(&self) -> &str {
            &self.id
        }

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        async fn execute(&self, _request: &ExecutionRequest) -> BackendResult<ExecutionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ExecutionResult::new(json!({"solver": self.id}))))
        }
    }

    struct Harness {
        store: Arc<JobStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        usage: Arc<UsageTracker>,
        sink: Arc<MemoryProvenanceSink>,
        dispatcher: Dispatcher,
    }

    /// Backend whose first call panics.
    struct Panicking {
        capabilities: Capabilities,
        calls: AtomicU64,
    }

    #[async_trait]
    impl Backend for Panicking {
        fn id(&self) -> &str {
            "panicky"
        }

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        async fn execute(&self, _request: &ExecutionRequest) -> BackendResult<ExecutionResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("solver state corrupted");
            }
            Ok(ExecutionResult::new(json!({"solver": "panicky"})))
        }
    }

    fn harness(backends: Vec<Arc<Scripted>>, max_retries: u32) -> Harness {
        let backends: Vec<Arc<dyn Backend>> = backends.into_iter().map(|b| b as Arc<dyn Backend>).collect();
        harness_with(backends, max_retries, 3)
    }

    fn harness_with(backends: Vec<Arc<dyn Backend>>, max_retries: u32, failure_threshold: u32) -> Harness {
        let chain: Vec<String> = backends.iter().map(|b| b.id().to_string()).collect();
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.register(backend);
        }
        let registry = Arc::new(registry);
        let store = Arc::new(JobStore::new(Duration::from_secs(86_400), Duration::from_secs(5)));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(60),
        }));
        let usage = Arc::new(UsageTracker::new());
        let sink = Arc::new(MemoryProvenanceSink::new());
        let selector = BackendSelector::new(registry.clone(), breakers.clone(), chain);
        let retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            breakers.clone(),
            selector,
            retry,
            usage.clone(),
            sink.clone(),
        );
        Harness {
            store,
            breakers,
            usage,
            sink,
            dispatcher,
        }
    }

    fn submit(h: &Harness) -> JobId {
        h.store
            .submit(JobDraft::new("alice", "qubo.minimize", json!({"q": 1})))
            .job
            .id
    }

    #[tokio::test]
    async fn test_success_on_first_candidate() {
        let a = Scripted::new("classical-a", vec![]);
        let h = harness(vec![a.clone()], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Completed);

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.solver_used.as_deref(), Some("classical-a"));
        assert_eq!(job.attempts.len(), 1);
        assert!(h.usage.for_job(id).is_some());
        assert_eq!(h.sink.for_job(id)[0].outcome, ProvenanceOutcome::Completed);
        assert_eq!(h.dispatcher.stats().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_falls_through_to_next_candidate() {
        let a = Scripted::new("classical-a", vec![Err(BackendError::Transient("reset".into()))]);
        let b = Scripted::new("classical-b", vec![]);
        let h = harness(vec![a.clone(), b.clone()], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        h.dispatcher.process(claimed).await.unwrap();

        let job = h.store.get(id).unwrap();
        assert_eq!(job.solver_used.as_deref(), Some("classical-b"));
        assert_eq!(job.attempts.len(), 2);
        assert_eq!(h.breakers.failure_count("classical-a"), 1);
        assert_eq!(h.breakers.failure_count("classical-b"), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_without_breaker_penalty() {
        let a = Scripted::new("classical-a", vec![Err(BackendError::InvalidInput("not square".into()))]);
        let b = Scripted::new("classical-b", vec![]);
        let h = harness(vec![a.clone(), b.clone()], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Failed);

        let job = h.store.get(id).unwrap();
        assert!(job.last_error.unwrap().contains("not square"));
        assert_eq!(b.calls(), 0);
        assert_eq!(h.breakers.failure_count("classical-a"), 0);
        assert_eq!(h.sink.for_job(id)[0].outcome, ProvenanceOutcome::Failed);
    }

    #[tokio::test]
    async fn test_exhausted_candidates_requeue() {
        let a = Scripted::new("classical-a", vec![Err(BackendError::Unavailable("down".into()))]);
        let h = harness(vec![a], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Queued);

        let job = h.store.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(h.usage.for_job(id).is_none());
        assert!(h.sink.entries().is_empty());
    }

    #[tokio::test]
    async fn test_no_retries_left_fails() {
        let a = Scripted::new("classical-a", vec![Err(BackendError::Transient("busy".into()))]);
        let h = harness(vec![a], 0);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Failed);
        assert_eq!(h.store.get(id).unwrap().attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable_failure() {
        let slow = Arc::new(Scripted {
            id: "slow".into(),
            capabilities: Capabilities::classical("slow"),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            delay: Duration::from_secs(10),
        });
        let fast = Scripted::new("fast", vec![]);
        let h = harness(vec![slow, fast], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        h.dispatcher.process(claimed).await.unwrap();

        let job = h.store.get(id).unwrap();
        assert_eq!(job.solver_used.as_deref(), Some("fast"));
        assert!(matches!(
            job.attempts[0].outcome,
            AttemptOutcome::Failed {
                kind: ErrorKind::Timeout,
                ..
            }
        ));
        assert!(job.attempts[0].duration_ms >= 5_000);
        assert!(job.attempts[0].duration_ms < 10_000);
        assert_eq!(h.breakers.state("slow"), CircuitState::Closed);
        assert_eq!(h.breakers.failure_count("slow"), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_attempt() {
        let a = Scripted::new("classical-a", vec![]);
        let h = harness(vec![a.clone()], 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        h.store.cancel(id).unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(a.calls(), 0);
        assert_eq!(h.store.get(id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.sink.for_job(id)[0].outcome, ProvenanceOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_panic_is_a_retryable_attempt_failure() {
        let panicky = Arc::new(Panicking {
            capabilities: Capabilities::classical("panicky"),
            calls: AtomicU64::new(0),
        });
        let h = harness_with(vec![panicky.clone()], 3, 3);
        let id = submit(&h);

        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Queued);

        let job = h.store.get(id).unwrap();
        assert_eq!(job.attempts.len(), 1);
        match &job.attempts[0].outcome {
            AttemptOutcome::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::Transient);
                assert!(message.contains("solver state corrupted"));
            }
            other => panic!("expected failed attempt, got {other:?}"),
        }
        assert_eq!(h.breakers.failure_count("panicky"), 1);

        // Same dispatcher keeps working once the job comes back.
        tokio::time::advance(Duration::from_millis(200)).await;
        let claimed = h.store.try_next_ready().unwrap();
        assert_eq!(h.dispatcher.process(claimed).await.unwrap(), JobStatus::Completed);
        assert_eq!(panicky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_settles_when_attempt_cannot_be_stored() {
        let a = Scripted::new(
            "classical-a",
            vec![
                Err(BackendError::Transient("reset".into())),
                Err(BackendError::Transient("reset again".into())),
            ],
        );
        let h = harness_with(vec![a.clone() as Arc<dyn Backend>], 3, 1);
        submit(&h);
        let claimed = h.store.try_next_ready().unwrap();
        h.dispatcher.process(claimed).await.unwrap();
        assert_eq!(h.breakers.state("classical-a"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;

        // A claim for a job the store no longer knows.
        let orphan = Job::from_draft(
            JobDraft::new("alice", "qubo.minimize", json!({"q": 2})),
            "orphan".into(),
            99,
            Duration::from_secs(5),
            chrono::Duration::days(1),
        );
        let claimed = ClaimedJob {
            job: orphan,
            cancel: CancellationToken::new(),
        };
        assert!(h.dispatcher.process(claimed).await.is_err());

        assert_eq!(a.calls(), 2);
        assert_eq!(h.breakers.state("classical-a"), CircuitState::Open);
        assert!(!h.breakers.would_admit("classical-a"));
    }
}
