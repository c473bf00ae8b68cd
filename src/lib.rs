//! HAL Orchestrator — Job Orchestration Core for Hybrid Optimization Dispatch
//!
//! This crate accepts optimization jobs, routes them across interchangeable
//! solving backends (a primary accelerated backend and ordered classical
//! fallbacks), and drives every job to a terminal state despite backend
//! failures, transient errors, or timeouts. Any solver implements the
//! [`Backend`] trait to participate.
//!
//! # Overview
//!
//! The core is built from:
//! - A [`JobStore`] with idempotent submission and a priority ready queue
//! - A [`CircuitBreakerRegistry`] with one breaker per backend
//! - A [`RetryPolicy`] with exponential backoff and jitter
//! - A [`BackendSelector`] ranking candidates by preference, fallback chain,
//!   capabilities and breaker state
//! - A [`Dispatcher`] worker pool driving attempts and state transitions
//! - A [`UsageTracker`] and a [`ProvenanceSink`] written on terminal states
//! - An [`ArchivalSweeper`] retiring terminal jobs past their TTL
//!
//! [`Orchestrator`] wires them together and exposes the submission and
//! health API.
//!
//! # Job lifecycle
//!
//! ```text
//!                    ┌──────── retry (delay, attempt_count += 1) ───────┐
//!                    ↓                                                  │
//!   submit ──→ Queued ──→ Running ──→ Completed ──┐                      │
//!                │          │  └──────────────────┼──────────────────────┘
//!                │          ├───→ Failed ─────────┼──→ Archived
//!                │          │       └─ retry_job ─┼─→ Queued
//!                └──────────┴───→ Cancelled ──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hal_orchestrator::{BackendRegistry, JobDraft, Orchestrator, OrchestratorConfig, TracingProvenanceSink};
//! use std::sync::Arc;
//!
//! let registry = BackendRegistry::new().with_backend(Arc::new(MyAnnealer::new()));
//! let orch = Orchestrator::new(OrchestratorConfig::load(None)?, registry, Arc::new(TracingProvenanceSink))?;
//! let handle = orch.start();
//! let job = orch.submit_job(JobDraft::new("alice", "qubo.minimize", inputs))?.job;
//! // ...
//! handle.shutdown().await;
//! ```

pub mod backend;
pub mod breaker;
pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod job;
pub mod orchestrator;
pub mod provenance;
pub mod result;
pub mod retry;
pub mod selector;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod usage;

pub use backend::{Backend, BackendRegistry, ExecutionRequest};
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use capability::{BackendKind, Capabilities};
pub use config::{ConfigError, OrchestratorConfig};
pub use dispatcher::{Dispatcher, DispatcherStatsSnapshot};
pub use error::{BackendError, BackendResult, ErrorKind, OrchestratorError, Result};
pub use health::{HealthSnapshot, OutcomeTotals};
pub use job::{AttemptOutcome, AttemptRecord, Job, JobDraft, JobId, JobStatus, Priority};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use provenance::{
    MemoryProvenanceSink, ProvenanceEntry, ProvenanceError, ProvenanceOutcome, ProvenanceSink,
    TracingProvenanceSink,
};
pub use result::ExecutionResult;
pub use retry::RetryPolicy;
pub use selector::BackendSelector;
pub use store::{ClaimedJob, JobFilter, JobStore, JobTransition, QueueDepth, Submission};
pub use sweeper::ArchivalSweeper;
pub use usage::{UsageDelta, UsageRecord, UsageTracker};
