use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

// key: circuit-breaker -> per-tenant-tool
//
// State is instance-scoped and does not survive restarts; it re-learns from
// failures quickly. All transitions happen under the mutex and the critical
// sections never span I/O.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }
}

/// Breaker table keyed by `(tenant_id, tool_id)`. Global tools get one
/// circuit per invoking tenant.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    circuits: Mutex<HashMap<(String, i64), BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether a call may be dispatched. May itself transition
    /// OPEN -> HALF_OPEN once the recovery timeout has elapsed.
    pub fn can_execute(&self, tenant_id: &str, tool_id: i64) -> bool {
        let mut circuits = self.circuits.lock().expect("breaker mutex");
        let circuit = circuits
            .entry((tenant_id.to_string(), tool_id))
            .or_insert_with(BreakerState::new);
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.success_count = 0;
                    tracing::info!(%tenant_id, tool_id, "circuit half-open, allowing probe");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, tenant_id: &str, tool_id: i64) {
        let mut circuits = self.circuits.lock().expect("breaker mutex");
        let circuit = circuits
            .entry((tenant_id.to_string(), tool_id))
            .or_insert_with(BreakerState::new);
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                circuit.success_count += 1;
                if circuit.success_count >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.failure_count = 0;
                    circuit.success_count = 0;
                    circuit.opened_at = None;
                    tracing::info!(%tenant_id, tool_id, "circuit closed after recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, tenant_id: &str, tool_id: i64) {
        let mut circuits = self.circuits.lock().expect("breaker mutex");
        let circuit = circuits
            .entry((tenant_id.to_string(), tool_id))
            .or_insert_with(BreakerState::new);
        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    tracing::warn!(%tenant_id, tool_id, failures = circuit.failure_count, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.success_count = 0;
                tracing::warn!(%tenant_id, tool_id, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {
                circuit.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn state(&self, tenant_id: &str, tool_id: i64) -> CircuitState {
        let circuits = self.circuits.lock().expect("breaker mutex");
        circuits
            .get(&(tenant_id.to_string(), tool_id))
            .map(|circuit| circuit.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Tools currently in OPEN state for a tenant, for the alert evaluator.
    pub fn open_circuits(&self, tenant_id: &str) -> Vec<i64> {
        let circuits = self.circuits.lock().expect("breaker mutex");
        circuits
            .iter()
            .filter(|((tenant, _), circuit)| {
                tenant == tenant_id && circuit.state == CircuitState::Open
            })
            .map(|((_, tool_id), _)| *tool_id)
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
