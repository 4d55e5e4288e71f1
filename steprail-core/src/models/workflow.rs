//! Workflow and pipeline data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default number of executor invocations allowed per step
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound for a single retry delay (600 seconds)
pub const MAX_RETRY_DELAY_MS: u64 = 600_000;

/// Top-level category of workflow progress
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    /// A step is executing
    Running,
    /// A step is waiting for external approval
    Gate,
    /// Every step finished
    Completed,
    /// A step failed or was rejected
    Failed,
    /// Cancelled by an operator
    Cancelled,
    /// Unrecognized phase, kept verbatim
    Other(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Running => "running",
            Phase::Gate => "gate",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
            Phase::Other(other) => other,
        }
    }

    /// Terminal phases never carry a step
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Running | Phase::Gate)
    }
}

impl From<&str> for Phase {
    fn from(value: &str) -> Self {
        match value {
            "running" => Phase::Running,
            "gate" => Phase::Gate,
            "completed" => Phase::Completed,
            "failed" => Phase::Failed,
            "cancelled" => Phase::Cancelled,
            other => Phase::Other(other.to_string()),
        }
    }
}

impl From<String> for Phase {
    fn from(value: String) -> Self {
        Phase::from(value.as_str())
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.as_str().to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured form of a `phase` or `phase:step` status string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedStatus {
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl ParsedStatus {
    pub fn new(phase: Phase, step: Option<&str>) -> Self {
        Self {
            phase,
            step: step.map(str::to_string),
        }
    }

    /// Step awaiting approval, if this status is a gate
    pub fn awaiting_approval(&self) -> Option<&str> {
        match self.phase {
            Phase::Gate => self.step.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ParsedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}:{}", self.phase, step),
            None => write!(f, "{}", self.phase),
        }
    }
}

/// Reason recorded for a realized transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// A step began executing
    StepStarted,
    /// A gated step started waiting for approval
    GateOpened,
    /// Approval was granted
    GateApproved,
    /// Approval was rejected
    GateRejected,
    /// Executor or recovery failed
    StepFailed,
    /// Retries ran out
    RecoveryExhausted,
    /// Last step finished
    Completed,
    /// Operator cancellation
    Cancelled,
    /// Caller-driven transition outside a pipeline
    Manual,
}

/// One realized transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionEvent {
    /// Unique transition ID
    pub id: Uuid,
    /// Status before the transition
    pub from: String,
    /// Status after the transition
    pub to: String,
    /// When the transition was committed
    pub timestamp: DateTime<Utc>,
    /// Why the transition happened
    pub cause: TransitionCause,
    /// Free-form detail (failure message, rejection reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Point-in-time copy of engine state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSnapshot {
    pub status: String,
    pub data: Value,
    pub history: Vec<TransitionEvent>,
}

/// Runtime state of a single pipeline step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Gated,
    Succeeded,
    Failed,
    Recovered,
    Skipped,
    Cancelled,
}

impl StepState {
    /// Running or waiting at a gate
    pub fn is_active(&self) -> bool {
        matches!(self, StepState::Running | StepState::Gated)
    }

    /// Finished in a way that lets the pipeline advance
    pub fn is_success(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Recovered)
    }
}

/// Per-step entry in a pipeline's ordered state list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    /// Step name
    pub name: String,
    /// Current state
    pub state: StepState,
    /// Executor invocations made in the current run
    #[serde(default)]
    pub attempts: u32,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StepState::Pending,
            attempts: 0,
        }
    }
}

/// Everything needed to resume a pipeline from cold start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSnapshot {
    pub current_step_index: usize,
    pub step_states: Vec<StepRecord>,
    pub workflow_snapshot: WorkflowSnapshot,
}

impl PipelineSnapshot {
    pub fn status(&self) -> &str {
        &self.workflow_snapshot.status
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of executor invocations (1-10)
    pub max_attempts: u32,
    /// Delay before first retry in milliseconds
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Whether to use exponential backoff
    #[serde(default)]
    pub exponential_backoff: bool,
    /// Multiplier for exponential backoff (>= 1.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: 0,
            exponential_backoff: false,
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
            delay.min(MAX_RETRY_DELAY_MS as f64) as u64
        } else {
            self.initial_delay_ms.min(MAX_RETRY_DELAY_MS)
        };

        Duration::from_millis(delay_ms)
    }
}
