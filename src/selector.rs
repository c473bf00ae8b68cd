//! Candidate backend selection.
//!
//! ```text
//!   preference? ──→ fallback chain ──→ dedup ──→ filter
//!                                                  │
//!          registered · supports operation · accepts input size · breaker admits
//! ```
//!
//! Ranking never claims a breaker trial. The dispatcher claims admission
//! with [`CircuitBreakerRegistry::is_available`] right before each attempt,
//! so a candidate ranked here may still be skipped there.

use std::sync::Arc;

use tracing::debug;

use crate::backend::BackendRegistry;
use crate::breaker::CircuitBreakerRegistry;
use crate::job::Job;

/// Ranks backends for a job.
#[derive(Debug, Clone)]
pub struct BackendSelector {
    registry: Arc<BackendRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    fallback_chain: Vec<String>,
}

impl BackendSelector {
    pub fn new(
        registry: Arc<BackendRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        fallback_chain: Vec<String>,
    ) -> Self {
        Self {
            registry,
            breakers,
            fallback_chain,
        }
    }

    pub fn fallback_chain(&self) -> &[String] {
        &self.fallback_chain
    }

    /// Backend ids to try for `job`, in order.
    ///
    /// An empty list means nothing can take the job right now.
    pub fn select_candidates(&self, job: &Job) -> Vec<String> {
        let input_bytes = job.input_bytes();
        let mut candidates: Vec<String> = Vec::new();

        let ordered = job
            .backend_preference
            .iter()
            .chain(self.fallback_chain.iter());
        for backend_id in ordered {
            if candidates.contains(backend_id) {
                continue;
            }
            let Some(backend) = self.registry.get(backend_id) else {
                debug!(job_id = %job.id, backend = %backend_id, "skipping unregistered backend");
                continue;
            };
            let capabilities = backend.capabilities();
            if !capabilities.supports_operation(&job.operation) {
                debug!(job_id = %job.id, backend = %backend_id, "operation not supported");
                continue;
            }
            if !capabilities.accepts_input(input_bytes) {
                debug!(job_id = %job.id, backend = %backend_id, input_bytes, "input too large");
                continue;
            }
            if !self.breakers.would_admit(backend_id) {
                debug!(job_id = %job.id, backend = %backend_id, "breaker not admitting");
                continue;
            }
            candidates.push(backend_id.clone());
        }
        candidates
    }
}
