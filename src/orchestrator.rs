//! Submission and health API.
//!
//! [`Orchestrator`] wires the job store, breakers, selector, dispatcher,
//! usage tracker and sweeper together from one validated configuration.
//! Nothing here is global: every shared component is built in
//! [`Orchestrator::new`] and handed out as an `Arc`.
//!
//! ## Method table
//!
//! | Method | Kind | Errors |
//! |--------|------|--------|
//! | `submit_job()` | sync | `InvalidDraft` |
//! | `get_job()` | sync | `JobNotFound` |
//! | `list_jobs()` | sync | none |
//! | `cancel_job()` | async | `JobNotFound`, `NotCancellable` |
//! | `retry_job()` | sync | `JobNotFound`, `NotRetryable` |
//! | `health()` | sync | none |
//! | `start()` | sync | none |

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{OrchestratorError, Result};
use crate::health::HealthSnapshot;
use crate::job::{Job, JobDraft, JobId, JobStatus};
use crate::provenance::ProvenanceSink;
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use crate::store::{JobFilter, JobStore, Submission};
use crate::sweeper::ArchivalSweeper;
use crate::usage::UsageTracker;

/// The orchestration core.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<JobStore>,
    registry: Arc<BackendRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    usage: Arc<UsageTracker>,
    dispatcher: Arc<Dispatcher>,
}

impl Orchestrator {
    /// Build the core. Fails if `config` does not validate.
    pub fn new(
        config: OrchestratorConfig,
        registry: BackendRegistry,
        provenance: Arc<dyn ProvenanceSink>,
    ) -> Result<Self> {
        config.validate()?;
        for backend_id in &config.fallback_chain {
            if !registry.contains(backend_id) {
                warn!(backend = %backend_id, "fallback chain names an unregistered backend");
            }
        }

        let store = Arc::new(JobStore::new(config.retention(), config.default_timeout()));
        let registry = Arc::new(registry);
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
        }));
        let usage = Arc::new(UsageTracker::new());
        let selector = BackendSelector::new(
            registry.clone(),
            breakers.clone(),
            config.fallback_chain.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            registry.clone(),
            breakers.clone(),
            selector,
            RetryPolicy::from_config(&config),
            usage.clone(),
            provenance,
        ));

        Ok(Self {
            config,
            store,
            registry,
            breakers,
            usage,
            dispatcher,
        })
    }

    /// Accept a job, or return the existing job for a repeated submission.
    pub fn submit_job(&self, draft: JobDraft) -> Result<Submission> {
        if draft.user_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidDraft("user_id is empty".into()));
        }
        if draft.operation.trim().is_empty() {
            return Err(OrchestratorError::InvalidDraft("operation is empty".into()));
        }
        if draft.timeout.is_some_and(|t| t.is_zero()) {
            return Err(OrchestratorError::InvalidDraft("timeout must be positive".into()));
        }
        if draft
            .idempotency_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            return Err(OrchestratorError::InvalidDraft("idempotency_key is blank".into()));
        }
        Ok(self.store.submit(draft))
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.store.get(job_id)
    }

    /// Jobs of one user. Archived jobs only when the filter asks for them.
    pub fn list_jobs(&self, user_id: &str, filter: &JobFilter) -> Vec<Job> {
        self.store.list(user_id, filter)
    }

    /// Cancel a queued job, or request cancellation of a running one.
    ///
    /// A queued job is terminal on return, so its (empty) usage and its
    /// provenance entry are written here. A running job is finished by its
    /// worker.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.cancel(job_id)?;
        if job.status == JobStatus::Cancelled {
            self.dispatcher.stats().record_cancelled();
            self.dispatcher.finalize(&job).await;
        }
        Ok(job)
    }

    /// Re-queue a failed job. Keeps its attempt count and leaves breakers alone.
    pub fn retry_job(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.retry(job_id)?;
        info!(job_id = %job_id, attempt = job.attempt_count, "manual retry queued");
        Ok(job)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            breakers: self.breakers.snapshot(),
            queue_depth: self.store.queue_depth(),
            totals: self.dispatcher.stats().snapshot().into(),
            generated_at: Utc::now(),
        }
    }

    /// Spawn the worker pool and the archival sweeper on the current runtime.
    pub fn start(&self) -> OrchestratorHandle {
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for worker in 0..self.config.workers {
            tasks.spawn(self.dispatcher.clone().run_worker(worker, shutdown.clone()));
        }
        let sweeper = ArchivalSweeper::new(self.store.clone(), self.config.sweep_interval());
        tasks.spawn(sweeper.run(shutdown.clone()));
        info!(workers = self.config.workers, "orchestrator started");
        OrchestratorHandle { shutdown, tasks }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

/// Running workers and sweeper.
#[derive(Debug)]
pub struct OrchestratorHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl OrchestratorHandle {
    /// Token that stops every task when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting work, let in-flight jobs finish, and join all tasks.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "orchestrator task ended abnormally");
            }
        }
        info!("orchestrator stopped");
    }
}
