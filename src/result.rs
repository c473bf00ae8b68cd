//! Execution result types.
//!
//! The core treats the solver output as opaque JSON. Only the fields
//! needed for accounting (measurement count, timing, optional cost) are
//! typed.

use serde::{Deserialize, Serialize};

/// Result of a successful backend execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Solver output, e.g. the best assignment and its energy.
    pub output: serde_json::Value,
    /// Number of measurement operations (shots, samples, reads) consumed.
    #[serde(default)]
    pub measurements: u64,
    /// Execution time reported by the backend, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Backend-reported cost. Overrides the capability-derived estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_cost: Option<f64>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionResult {
    /// Create a new execution result.
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            measurements: 0,
            execution_time_ms: None,
            reported_cost: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the number of measurement operations.
    pub fn with_measurements(mut self, measurements: u64) -> Self {
        self.measurements = measurements;
        self
    }

    /// Set the execution time.
    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = Some(time_ms);
        self
    }

    /// Set a backend-reported cost.
    pub fn with_reported_cost(mut self, cost: f64) -> Self {
        self.reported_cost = Some(cost);
        self
    }

    /// Set metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Size of the serialized output in bytes.
    pub fn output_bytes(&self) -> u64 {
        self.output.to_string().len() as u64
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self::new(serde_json::Value::Null)
    }
}
