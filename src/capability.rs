//! Backend capability introspection.
//!
//! Each backend advertises what it can run: its kind, the operations it
//! accepts, the largest payload it takes, and what a second of its time
//! costs. The selector uses these to filter candidates; the dispatcher
//! uses the cost rate to fill in `cost_estimate`.
//!
//! Capabilities are static. Liveness is tracked separately by the
//! circuit breaker registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hardware class of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum BackendKind {
    /// Quantum or other accelerated hardware (annealer, QPU, FPGA).
    Accelerated,
    /// Classical solver running on CPUs/GPUs.
    Classical,
    /// Simulator of an accelerated device.
    Simulator,
}

/// Static description of a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Name of the backend.
    pub name: String,
    /// Hardware class.
    pub kind: BackendKind,
    /// Operations this backend accepts. Empty means any operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<String>,
    /// Largest serialized input accepted, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_bytes: Option<u64>,
    /// Cost per second of backend time, in account currency units.
    pub cost_per_second: f64,
}

impl Capabilities {
    /// Capabilities for an accelerated backend (quantum annealer, QPU).
    ///
    /// Accelerated hardware is usually the scarce, expensive tier.
    pub fn accelerated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::Accelerated,
            operations: vec![],
            max_input_bytes: Some(1 << 20),
            cost_per_second: 1.0,
        }
    }

    /// Capabilities for a classical solver.
    pub fn classical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::Classical,
            operations: vec![],
            max_input_bytes: None,
            cost_per_second: 0.01,
        }
    }

    /// Capabilities for a simulator.
    pub fn simulator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: BackendKind::Simulator,
            operations: vec![],
            max_input_bytes: Some(64 << 10),
            cost_per_second: 0.0,
        }
    }

    /// Restrict the accepted operations.
    pub fn with_operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = operations.into_iter().map(Into::into).collect();
        self
    }

    /// Set the payload size limit. `None` lifts it.
    pub fn with_max_input_bytes(mut self, limit: Option<u64>) -> Self {
        self.max_input_bytes = limit;
        self
    }

    /// Set the cost rate.
    pub fn with_cost_per_second(mut self, rate: f64) -> Self {
        self.cost_per_second = rate;
        self
    }

    /// Check if an operation is accepted.
    pub fn supports_operation(&self, operation: &str) -> bool {
        self.operations.is_empty() || self.operations.iter().any(|op| op == operation)
    }

    /// Check if a payload of `bytes` fits.
    pub fn accepts_input(&self, bytes: u64) -> bool {
        self.max_input_bytes.is_none_or(|limit| bytes <= limit)
    }

    /// Cost of running this backend for `elapsed`.
    pub fn estimate_cost(&self, elapsed: Duration) -> f64 {
        self.cost_per_second * elapsed.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_accelerated() {
        let caps = Capabilities::accelerated("annealer").with_operations(["qubo.minimize"]);
        assert_eq!(caps.kind, BackendKind::Accelerated);
        assert!(caps.supports_operation("qubo.minimize"));
        assert!(!caps.supports_operation("lp.solve"));
        assert!(caps.accepts_input(1024));
        assert!(!caps.accepts_input(2 << 20));
    }

    #[test]
    fn test_capabilities_classical_accepts_anything() {
        let caps = Capabilities::classical("milp");
        assert!(caps.supports_operation("lp.solve"));
        assert!(caps.accepts_input(u64::MAX));
    }

    #[test]
    fn test_estimate_cost() {
        let caps = Capabilities::classical("milp").with_cost_per_second(2.0);
        let cost = caps.estimate_cost(Duration::from_millis(1500));
        assert!((cost - 3.0).abs() < 1e-10);
        assert_eq!(Capabilities::simulator("sim").estimate_cost(Duration::from_secs(9)), 0.0);
    }

    #[test]
    fn test_capabilities_json_fields() {
        let value = serde_json::to_value(Capabilities::simulator("sim")).unwrap();
        let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["cost_per_second", "kind", "max_input_bytes", "name"]);
        assert_eq!(value["kind"], "simulator");
    }
}
