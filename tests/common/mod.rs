#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hal_orchestrator::{
    Backend, BackendError, BackendRegistry, BackendResult, Capabilities, ExecutionRequest,
    ExecutionResult, Job, JobId, JobStatus, MemoryProvenanceSink, Orchestrator,
    OrchestratorConfig, ProvenanceEntry, ProvenanceError, ProvenanceSink,
};
use serde_json::json;

/// One scripted backend response.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(BackendError),
    Panic(String),
    Delay(Duration, Box<Step>),
}

/// Backend that plays a script, then repeats a fallback step.
pub struct MockBackend {
    id: String,
    capabilities: Capabilities,
    script: Mutex<VecDeque<Step>>,
    otherwise: Step,
    calls: AtomicUsize,
    seen: Mutex<Vec<JobId>>,
}

impl MockBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: Capabilities::classical(id),
            script: Mutex::new(VecDeque::new()),
            otherwise: Step::Succeed,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn script(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script = Mutex::new(steps.into_iter().collect());
        self
    }

    pub fn otherwise(mut self, step: Step) -> Self {
        self.otherwise = step;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Jobs this backend was asked to run, in call order.
    pub fn seen(&self) -> Vec<JobId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn execute(&self, request: &ExecutionRequest) -> BackendResult<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.job_id);
        let scripted = self.script.lock().unwrap().pop_front();
        let mut step = scripted.unwrap_or_else(|| self.otherwise.clone());
        loop {
            match step {
                Step::Succeed => {
                    return Ok(ExecutionResult::new(json!({ "solver": self.id }))
                        .with_measurements(64));
                }
                Step::Fail(err) => return Err(err),
                Step::Panic(msg) => panic!("{msg}"),
                Step::Delay(delay, next) => {
                    tokio::time::sleep(delay).await;
                    step = *next;
                }
            }
        }
    }
}

pub fn transient(msg: &str) -> Step {
    Step::Fail(BackendError::Transient(msg.to_string()))
}

/// Config tuned for fast tests; override fields as needed.
pub fn config(chain: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        failure_threshold: 3,
        recovery_timeout_secs: 30,
        max_retries: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
        workers: 2,
        default_timeout_secs: 5,
        fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Sink whose store is always down.
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvenanceSink for FailingSink {
    async fn record(&self, _entry: ProvenanceEntry) -> Result<(), ProvenanceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProvenanceError::Unavailable("audit store offline".into()))
    }
}

pub fn orchestrator(
    config: OrchestratorConfig,
    backends: &[Arc<MockBackend>],
) -> (Arc<Orchestrator>, Arc<MemoryProvenanceSink>) {
    let sink = Arc::new(MemoryProvenanceSink::new());
    let orch = orchestrator_with_sink(config, backends, sink.clone());
    (orch, sink)
}

pub fn orchestrator_with_sink(
    config: OrchestratorConfig,
    backends: &[Arc<MockBackend>],
    sink: Arc<dyn ProvenanceSink>,
) -> Arc<Orchestrator> {
    let mut registry = BackendRegistry::new();
    for backend in backends {
        registry.register(backend.clone());
    }
    Arc::new(Orchestrator::new(config, registry, sink).unwrap())
}

/// Poll until the job reaches `status`.
pub async fn wait_for(orch: &Orchestrator, job_id: JobId, status: JobStatus) -> Job {
    for _ in 0..20_000 {
        let job = orch.get_job(job_id).unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = orch.get_job(job_id).unwrap();
    panic!("job {job_id} stuck in {} waiting for {status}", job.status);
}
