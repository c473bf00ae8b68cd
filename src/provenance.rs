//! Provenance sink interface.
//!
//! Every job that reaches a terminal state produces one
//! [`ProvenanceEntry`]. The core only writes entries; storing them
//! (append-only log, ledger, message bus) is the sink's business. A sink
//! failure is logged and never changes the job's outcome.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::job::{AttemptRecord, Job, JobId, JobStatus};

/// Final outcome recorded for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl ProvenanceOutcome {
    /// Outcome for a terminal status, `None` for anything else.
    pub fn from_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Completed => Some(Self::Completed),
            JobStatus::Failed => Some(Self::Failed),
            JobStatus::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Audit record of a finished job.
///
/// Carries digests of the payloads rather than the payloads themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub job_id: JobId,
    pub user_id: String,
    pub operation: String,
    pub outcome: ProvenanceOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_used: Option<String>,
    /// SHA-256 of the serialized inputs, hex encoded.
    pub input_digest: String,
    /// SHA-256 of the serialized output, if there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<String>,
    pub retry_cycles: u32,
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl ProvenanceEntry {
    /// Build the entry for a job in a terminal state.
    pub fn for_job(job: &Job) -> Option<Self> {
        let outcome = ProvenanceOutcome::from_status(job.status)?;
        Some(Self {
            job_id: job.id,
            user_id: job.user_id.clone(),
            operation: job.operation.clone(),
            outcome,
            solver_used: job.solver_used.clone(),
            input_digest: digest(&job.inputs),
            output_digest: job.result.as_ref().map(|r| digest(&r.output)),
            retry_cycles: job.attempt_count,
            attempts: job.attempts.clone(),
            last_error: job.last_error.clone(),
            cost_estimate: job.cost_estimate,
            recorded_at: Utc::now(),
        })
    }
}

fn digest(value: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

/// Errors returned by a provenance sink.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("Provenance sink unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode provenance entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write-only destination for provenance entries.
#[async_trait]
pub trait ProvenanceSink: Send + Sync {
    async fn record(&self, entry: ProvenanceEntry) -> Result<(), ProvenanceError>;
}

/// Sink that emits each entry as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProvenanceSink;

#[async_trait]
impl ProvenanceSink for TracingProvenanceSink {
    async fn record(&self, entry: ProvenanceEntry) -> Result<(), ProvenanceError> {
        let attempts = serde_json::to_string(&entry.attempts)?;
        info!(
            target: "provenance",
            job_id = %entry.job_id,
            user = %entry.user_id,
            outcome = ?entry.outcome,
            solver = entry.solver_used.as_deref().unwrap_or("-"),
            input_digest = %entry.input_digest,
            retry_cycles = entry.retry_cycles,
            attempts = %attempts,
            "job provenance"
        );
        Ok(())
    }
}

/// Sink that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryProvenanceSink {
    entries: Mutex<Vec<ProvenanceEntry>>,
}

impl MemoryProvenanceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded so far, in order.
    pub fn entries(&self) -> Vec<ProvenanceEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries recorded for one job.
    pub fn for_job(&self, job_id: JobId) -> Vec<ProvenanceEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }
}

#[async_trait]
impl ProvenanceSink for MemoryProvenanceSink {
    async fn record(&self, entry: ProvenanceEntry) -> Result<(), ProvenanceError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}
