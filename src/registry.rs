use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Outcome of a single health probe against a backend's `/queue` endpoint.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Success { queue_running: usize, queue_pending: usize },
    Failure,
}

/// Live status record for one registered backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub address: String,
    pub available: bool,
    pub queue_running: u32,
    pub queue_pending: u32,
    pub in_flight: u32,
    pub last_probe_at: Option<u64>,
    pub consecutive_errors: u32,
}

impl BackendStatus {
    fn new(address: String) -> Self {
        Self {
            address,
            available: true,
            queue_running: 0,
            queue_pending: 0,
            in_flight: 0,
            last_probe_at: None,
            consecutive_errors: 0,
        }
    }

    /// Composite load metric used solely by the selector.
    pub fn total_load(&self) -> u64 {
        self.queue_running as u64 + self.queue_pending as u64 + self.in_flight as u64
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Concurrent registry of backend load/availability state.
///
/// Every mutating method is a single DashMap operation — readers snapshot
/// with `snapshot()` rather than holding a shard lock across I/O.
pub struct BackendRegistry {
    backends: DashMap<String, BackendStatus>,
    failure_threshold: u32,
}

impl BackendRegistry {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            backends: DashMap::new(),
            failure_threshold,
        }
    }

    /// Idempotent; no-op if already present.
    pub fn add(&self, address: &str) {
        self.backends
            .entry(address.to_string())
            .or_insert_with(|| BackendStatus::new(address.to_string()));
    }

    /// Idempotent.
    pub fn remove(&self, address: &str) {
        self.backends.remove(address);
    }

    pub fn contains(&self, address: &str) -> bool {
        self.backends.contains_key(address)
    }

    /// Immutable snapshot of all backends.
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.backends.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get(&self, address: &str) -> Option<BackendStatus> {
        self.backends.get(address).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Apply the outcome of a health probe. On success, resets the error
    /// count and marks the backend available. On failure, increments the
    /// error count and flips `available` false once the threshold is
    /// crossed. No-ops if the backend was removed mid-probe.
    pub fn apply_probe(&self, address: &str, outcome: ProbeOutcome) {
        let Some(mut entry) = self.backends.get_mut(address) else {
            return;
        };
        entry.last_probe_at = Some(now_unix());
        match outcome {
            ProbeOutcome::Success {
                queue_running,
                queue_pending,
            } => {
                entry.queue_running = queue_running as u32;
                entry.queue_pending = queue_pending as u32;
                entry.consecutive_errors = 0;
                entry.available = true;
            }
            ProbeOutcome::Failure => {
                entry.consecutive_errors += 1;
                if entry.consecutive_errors >= self.failure_threshold {
                    entry.available = false;
                }
            }
        }
    }

    /// Dispatched-but-unacknowledged counter. Called before the first
    /// network call for a job against this backend.
    pub fn inc_in_flight(&self, address: &str) {
        if let Some(mut entry) = self.backends.get_mut(address) {
            entry.in_flight += 1;
        }
    }

    /// Clamped at zero; a no-op if the backend was removed or already at
    /// zero.
    pub fn dec_in_flight(&self, address: &str) {
        if let Some(mut entry) = self.backends.get_mut(address) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }
}

/// RAII guard bracketing a dispatched job: increments on construction,
/// decrements on every exit path (success, error, timeout, panic,
/// cancellation) via `Drop`.
pub struct InFlightGuard<'a> {
    registry: &'a BackendRegistry,
    address: String,
}

impl<'a> InFlightGuard<'a> {
    pub fn new(registry: &'a BackendRegistry, address: &str) -> Self {
        registry.inc_in_flight(address);
        Self {
            registry,
            address: address.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.dec_in_flight(&self.address);
    }
}
