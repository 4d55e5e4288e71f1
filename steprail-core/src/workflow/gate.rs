//! Pending approval gates

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Resolution of a gated step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Approval was granted
    Approved,
    /// Approval was rejected with a reason
    Rejected(String),
}

/// Gate currently waiting for a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    /// Name of the gated step
    pub step_name: String,
    /// When the gate opened
    pub requested_at: DateTime<Utc>,
}

struct PendingGate {
    requested_at: DateTime<Utc>,
    tx: oneshot::Sender<GateDecision>,
}

/// Holds the response channels of open gates, keyed by step name
#[derive(Default)]
pub struct GateKeeper {
    pending: DashMap<String, PendingGate>,
}

impl GateKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a gate for `step_name`, replacing any stale one
    pub fn open(&self, step_name: &str) -> oneshot::Receiver<GateDecision> {
        let (tx, rx) = oneshot::channel();
        let gate = PendingGate {
            requested_at: Utc::now(),
            tx,
        };

        if self.pending.insert(step_name.to_string(), gate).is_some() {
            tracing::debug!(step = step_name, "Replaced stale gate");
        }
        tracing::info!(step = step_name, "Gate opened, awaiting approval");

        rx
    }

    /// Deliver a decision; false when no gate is open for `step_name`
    pub fn resolve(&self, step_name: &str, decision: GateDecision) -> bool {
        let Some((_key, gate)) = self.pending.remove(step_name) else {
            return false;
        };

        tracing::info!(step = step_name, decision = ?decision, "Gate resolved");
        // A dropped receiver means the run already stopped
        gate.tx.send(decision).is_ok()
    }

    /// Drop the gate for `step_name` without a decision
    pub fn discard(&self, step_name: &str) -> bool {
        self.pending.remove(step_name).is_some()
    }

    pub fn is_pending(&self, step_name: &str) -> bool {
        self.pending.contains_key(step_name)
    }

    /// Open gates, oldest first
    pub fn pending(&self) -> Vec<GateRequest> {
        let mut requests: Vec<_> = self
            .pending
            .iter()
            .map(|entry| GateRequest {
                step_name: entry.key().clone(),
                requested_at: entry.value().requested_at,
            })
            .collect();
        requests.sort_by_key(|request| request.requested_at);
        requests
    }

    /// Drop every open gate; waiting receivers observe a closed channel
    pub fn close_all(&self) {
        self.pending.clear();
    }
}
