//! Step executor and recovery traits and types

use crate::models::workflow::{StepRecord, StepState};
use crate::workflow::cursor::DataCursor;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Typed failure returned by a step executor or a recovery handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl StepFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        StepFailure::Failed(message.into())
    }
}

pub type StepResult = Result<(), StepFailure>;

/// What a step executor sees while it runs
#[derive(Debug, Clone)]
pub struct StepContext {
    step_name: String,
    step_index: usize,
    attempt: u32,
    cursor: DataCursor,
    prior_states: Arc<[StepRecord]>,
    signal: CancellationToken,
}

impl StepContext {
    pub fn new(
        step_name: impl Into<String>,
        step_index: usize,
        attempt: u32,
        cursor: DataCursor,
        prior_states: Arc<[StepRecord]>,
        signal: CancellationToken,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            step_index,
            attempt,
            cursor,
            prior_states,
            signal,
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// 1-based executor invocation count for this step
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Root cursor over the workflow data
    pub fn cursor(&self) -> &DataCursor {
        &self.cursor
    }

    /// Cursor scoped to this step's name
    pub fn scoped(&self) -> DataCursor {
        self.cursor.scope(&self.step_name)
    }

    /// States of the steps before this one, in pipeline order
    pub fn prior_states(&self) -> &[StepRecord] {
        &self.prior_states
    }

    pub fn state_of(&self, step_name: &str) -> Option<StepState> {
        self.prior_states
            .iter()
            .find(|record| record.name == step_name)
            .map(|record| record.state)
    }

    /// Cancellation signal; executors should return promptly once it fires
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

/// Unit of work run for one pipeline step
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: StepContext) -> StepResult;
}

/// Decision of a recovery handler after an executor failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Treat the step as done and advance
    Recovered,
    /// Invoke the executor again, bounded by max attempts
    Retry,
    /// Give up; the pipeline fails
    Fail,
}

/// Invoked when a step's executor fails
///
/// Returning `Err` means recovery itself failed; the pipeline then fails
/// with that error as the reported cause.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(
        &self,
        failure: &StepFailure,
        attempt: u32,
        cursor: &DataCursor,
    ) -> Result<RecoveryOutcome, StepFailure>;
}

struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> StepExecutor for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    async fn execute(&self, ctx: StepContext) -> StepResult {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a step executor
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepExecutor>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(FnStep(f))
}

struct FnRecovery<F>(F);

#[async_trait]
impl<F, Fut> RecoveryHandler for FnRecovery<F>
where
    F: Fn(StepFailure, u32, DataCursor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RecoveryOutcome, StepFailure>> + Send + 'static,
{
    async fn recover(
        &self,
        failure: &StepFailure,
        attempt: u32,
        cursor: &DataCursor,
    ) -> Result<RecoveryOutcome, StepFailure> {
        (self.0)(failure.clone(), attempt, cursor.clone()).await
    }
}

/// Wrap an async closure as a recovery handler
pub fn recovery_fn<F, Fut>(f: F) -> Arc<dyn RecoveryHandler>
where
    F: Fn(StepFailure, u32, DataCursor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RecoveryOutcome, StepFailure>> + Send + 'static,
{
    Arc::new(FnRecovery(f))
}

/// Recovery that retries every failure except cancellation
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnFailure;

#[async_trait]
impl RecoveryHandler for RetryOnFailure {
    async fn recover(
        &self,
        failure: &StepFailure,
        attempt: u32,
        _cursor: &DataCursor,
    ) -> Result<RecoveryOutcome, StepFailure> {
        if *failure == StepFailure::Cancelled {
            return Ok(RecoveryOutcome::Fail);
        }
        tracing::debug!(attempt, error = %failure, "Retrying failed step");
        Ok(RecoveryOutcome::Retry)
    }
}
