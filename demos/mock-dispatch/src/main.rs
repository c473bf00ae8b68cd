//! Mock dispatch run of the orchestration core.
//!
//! Registers a flaky accelerated backend and two classical fallbacks,
//! submits a batch of jobs, waits for them to settle, and prints the
//! resulting jobs and health snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hal_orchestrator::{
    Backend, BackendError, BackendRegistry, BackendResult, Capabilities, ExecutionRequest,
    ExecutionResult, JobDraft, JobFilter, Orchestrator, OrchestratorConfig, Priority,
    TracingProvenanceSink, telemetry,
};
use rand::Rng;
use serde_json::json;

/// Accelerated backend that fails a share of its attempts.
struct FlakyAnnealer {
    capabilities: Capabilities,
    failure_rate: f64,
}

#[async_trait]
impl Backend for FlakyAnnealer {
    fn id(&self) -> &str {
        "primary-quantum"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn execute(&self, request: &ExecutionRequest) -> BackendResult<ExecutionResult> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        if rand::rng().random_bool(self.failure_rate) {
            return Err(BackendError::Transient("annealer calibration drift".into()));
        }
        let size = request.inputs["size"].as_u64().unwrap_or(0);
        Ok(ExecutionResult::new(json!({ "energy": -(size as f64) * 1.5 }))
            .with_measurements(1000)
            .with_execution_time(40))
    }
}

/// Classical solver that always answers, just slower.
struct ClassicalSolver {
    id: &'static str,
    capabilities: Capabilities,
}

#[async_trait]
impl Backend for ClassicalSolver {
    fn id(&self) -> &str {
        self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn execute(&self, request: &ExecutionRequest) -> BackendResult<ExecutionResult> {
        if !request.inputs["size"].is_u64() {
            return Err(BackendError::InvalidInput("missing problem size".into()));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        let size = request.inputs["size"].as_u64().unwrap_or(0);
        Ok(ExecutionResult::new(json!({ "energy": -(size as f64) }))
            .with_execution_time(120))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let config = OrchestratorConfig {
        failure_threshold: 3,
        recovery_timeout_secs: 2,
        base_delay_ms: 50,
        max_delay_ms: 500,
        ..OrchestratorConfig::default()
    };

    let registry = BackendRegistry::new()
        .with_backend(Arc::new(FlakyAnnealer {
            capabilities: Capabilities::accelerated("primary-quantum").with_operations(["qubo.minimize"]),
            failure_rate: 0.6,
        }))
        .with_backend(Arc::new(ClassicalSolver {
            id: "classical-a",
            capabilities: Capabilities::classical("classical-a"),
        }))
        .with_backend(Arc::new(ClassicalSolver {
            id: "classical-b",
            capabilities: Capabilities::classical("classical-b"),
        }));

    let orch = Orchestrator::new(config, registry, Arc::new(TracingProvenanceSink))?;
    let handle = orch.start();

    let mut ids = Vec::new();
    for size in 1..=8u64 {
        let priority = if size % 4 == 0 { Priority::Urgent } else { Priority::Normal };
        let draft = JobDraft::new("demo-user", "qubo.minimize", json!({ "size": size }))
            .with_priority(priority);
        ids.push(orch.submit_job(draft)?.job.id);
    }
    // Same payload again: replayed, not duplicated.
    let replay = orch.submit_job(JobDraft::new("demo-user", "qubo.minimize", json!({ "size": 1 })))?;
    println!("replayed submission: {} (replayed = {})", replay.job.id, replay.replayed);

    // Input the solvers reject: fails without retrying.
    ids.push(
        orch.submit_job(JobDraft::new("demo-user", "milp.solve", json!({ "rows": 3 })))?
            .job
            .id,
    );

    loop {
        let pending = ids
            .iter()
            .filter_map(|id| orch.get_job(*id).ok())
            .filter(|job| job.status.is_pending())
            .count();
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.shutdown().await;

    println!();
    println!("{:<38} {:<10} {:<16} {:>7}", "job", "status", "solver", "cycles");
    for job in orch.list_jobs("demo-user", &JobFilter::new()) {
        println!(
            "{:<38} {:<10} {:<16} {:>7}",
            job.id.to_string(),
            job.status.to_string(),
            job.solver_used.as_deref().unwrap_or("-"),
            job.attempt_count,
        );
    }

    println!();
    println!("{}", serde_json::to_string_pretty(&orch.health())?);
    for record in orch.usage().for_user("demo-user") {
        println!("usage {}: {}", record.period, serde_json::to_string(&record)?);
    }

    Ok(())
}
