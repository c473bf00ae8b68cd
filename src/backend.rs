//! Backend trait and registry.
//!
//! The [`Backend`] trait is the capability contract every solver
//! implements to participate in dispatch:
//!
//! ```text
//!   id() / capabilities() ──→ execute(request) ──→ ExecutionResult
//!       (sync, &ref)              (async)          | BackendError
//! ```
//!
//! ## Design principles
//!
//! - **Async-native**: `execute()` is async and may suspend.
//! - **Thread-safe**: `Send + Sync` bound enables shared ownership.
//! - **Classified failures**: every error maps to an
//!   [`ErrorKind`](crate::error::ErrorKind) so the dispatcher can decide
//!   between trying the next candidate, re-queueing, or failing the job.
//! - **Opaque payloads**: the core never interprets `inputs`; validating
//!   their shape is the backend's job.
//!
//! ## Method table
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `id()` | sync | yes | `&str` |
//! | `capabilities()` | sync | yes | `&Capabilities` |
//! | `execute()` | async | yes | `BackendResult<ExecutionResult>` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;
use crate::error::BackendResult;
use crate::job::{Job, JobId};
use crate::result::ExecutionResult;

/// Trait for solving backends.
///
/// # Contract
///
/// - `id()` MUST be stable for the backend's lifetime; breakers and
///   provenance records are keyed by it.
/// - `capabilities()` MUST be synchronous and infallible.
/// - `execute()` SHOULD honour `request.timeout`. The dispatcher enforces
///   it regardless and reports an overrun as a timeout.
/// - Input the backend cannot solve MUST be reported as
///   `BackendError::InvalidInput`, not as a transient failure.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier of this backend (e.g. `"primary-quantum"`).
    fn id(&self) -> &str;

    /// Static capabilities of this backend.
    fn capabilities(&self) -> &Capabilities;

    /// Run one optimization attempt.
    async fn execute(&self, request: &ExecutionRequest) -> BackendResult<ExecutionResult>;
}

/// Everything a backend needs for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub operation: String,
    pub inputs: serde_json::Value,
    /// Time budget for this attempt.
    pub timeout: Duration,
}

impl ExecutionRequest {
    /// Build the request for the next attempt of `job`.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            operation: job.operation.clone(),
            inputs: job.inputs.clone(),
            timeout: job.timeout,
        }
    }
}

/// Registered backends, keyed by id.
///
/// Built once at startup and shared read-only afterwards. New backends are
/// added here; nothing in the dispatcher names a backend directly.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: FxHashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id, returning the one it replaced.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Option<Arc<dyn Backend>> {
        self.backends.insert(backend.id().to_string(), backend)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    /// Look up a backend.
    pub fn get(&self, backend_id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(backend_id).cloned()
    }

    /// Check if a backend is registered.
    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if no backend is registered.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.ids())
            .finish()
    }
}
