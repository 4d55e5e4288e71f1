//! Error taxonomy for the workflow engine and pipeline

use crate::workflow::executor::StepFailure;
use thiserror::Error;

/// Errors raised by the engine, the pipeline and gate resolution
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("Illegal transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    #[error("Step '{step}' failed: {source}")]
    StepExecutionFailure {
        step: String,
        #[source]
        source: StepFailure,
    },

    #[error("Step '{step}' exhausted recovery after {attempts} attempts: {last}")]
    RecoveryExhausted {
        step: String,
        attempts: u32,
        last: StepFailure,
    },

    #[error("Recovery of step '{step}' failed: {source} (step failure: {failure})")]
    RecoveryFailed {
        step: String,
        failure: StepFailure,
        #[source]
        source: StepFailure,
    },

    #[error("Gate '{step}' rejected: {reason}")]
    GateRejected { step: String, reason: String },

    #[error("Snapshot does not match pipeline: {0}")]
    SnapshotMismatch(String),

    #[error("Step '{step}' is not awaiting approval (status is '{status}')")]
    NotGated { step: String, status: String },

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),
}

impl WorkflowError {
    /// Step failures that a run contains and reports instead of propagating
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self,
            WorkflowError::StepExecutionFailure { .. }
                | WorkflowError::RecoveryExhausted { .. }
                | WorkflowError::RecoveryFailed { .. }
                | WorkflowError::GateRejected { .. }
        )
    }
}
