//! Operator Status Support
//!
//! Read-only snapshots of limiter and breaker state for the status view and
//! the `status` CLI command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::StoreFailurePolicy;
use crate::circuit_breaker::{CircuitSnapshot, CircuitState};

/// Snapshot of one operation's bucket and queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation: String,

    /// Tokens in the bucket, refilled to the time of the snapshot
    pub tokens_available: f64,

    pub burst_capacity: u32,
    pub rate_per_second: f64,

    /// Callers currently parked
    pub queue_length: usize,

    /// Tokens requested by parked callers
    pub queued_tokens: u64,

    /// Earliest time the head of the queue (or a new 1-token caller) can be granted
    pub next_available_at: DateTime<Utc>,
}

impl OperationStatus {
    /// Whether a new 1-token caller would be granted without waiting
    pub fn is_available(&self) -> bool {
        self.queue_length == 0 && self.tokens_available >= 1.0
    }

    /// Seconds until `next_available_at`, rounded up, relative to `now`
    pub fn retry_in_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.next_available_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

/// Summary across all operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub operations: usize,
    pub queued_callers: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
}

/// Full status view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Timestamp of data generation
    pub timestamp: DateTime<Utc>,

    /// Token store backend name
    pub backend: String,

    pub failure_policy: StoreFailurePolicy,
    pub summary: StatusSummary,
    pub operations: Vec<OperationStatus>,
    pub circuits: Vec<CircuitSnapshot>,
}

impl StatusReport {
    pub fn new(
        backend: &str,
        failure_policy: StoreFailurePolicy,
        operations: Vec<OperationStatus>,
        circuits: Vec<CircuitSnapshot>,
    ) -> Self {
        let count_state = |state: CircuitState| circuits.iter().filter(|c| c.state == state).count();
        let summary = StatusSummary {
            operations: operations.len(),
            queued_callers: operations.iter().map(|o| o.queue_length).sum(),
            open_circuits: count_state(CircuitState::Open),
            half_open_circuits: count_state(CircuitState::HalfOpen),
        };

        Self {
            timestamp: Utc::now(),
            backend: backend.to_string(),
            failure_policy,
            summary,
            operations,
            circuits,
        }
    }

    /// Status for one operation
    pub fn operation(&self, name: &str) -> Option<&OperationStatus> {
        self.operations.iter().find(|o| o.operation == name)
    }
}
