//! Gated step pipeline
//!
//! A `Pipeline` walks an ordered list of steps, driving its
//! [`WorkflowEngine`] through `running:<step>` and `gate:<step>` statuses and
//! ending in `completed`, `failed` or `cancelled`. Steps run strictly one at
//! a time. The engine, step states and step index live behind one mutex that
//! is never held across an `.await`, so `approve`, `reject`, `cancel` and
//! `snapshot` can be called from other tasks while `run` is suspended.
//!
//! Listeners registered through [`Pipeline::subscribe`] run while that mutex
//! is held and must not call back into the pipeline.

use crate::error::WorkflowError;
use crate::models::workflow::{
    Phase, PipelineSnapshot, RetryPolicy, StepRecord, StepState, TransitionCause,
    TransitionEvent,
};
use crate::workflow::cursor::DataCursor;
use crate::workflow::engine::{ListenerId, WorkflowEngine};
use crate::workflow::executor::{
    RecoveryHandler, RecoveryOutcome, StepContext, StepExecutor, StepFailure, StepResult,
};
use crate::workflow::gate::{GateDecision, GateKeeper, GateRequest};
use crate::workflow::status::{
    gate_status, parse_status, running_status, STATUS_CANCELLED, STATUS_COMPLETED,
    STATUS_FAILED, STATUS_RUNNING,
};
use crate::workflow::transitions::TransitionMap;
use crate::workflow::validator::PipelineValidator;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One named unit of work in a pipeline
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique within the pipeline; becomes the `step` segment of the status
    pub name: String,
    pub executor: Arc<dyn StepExecutor>,
    /// Consulted when the executor fails
    pub recovery: Option<Arc<dyn RecoveryHandler>>,
    /// Requires external approval before the executor runs
    pub gate: bool,
    /// Overrides the pipeline's retry policy
    pub retry_policy: Option<RetryPolicy>,
    /// Overrides the pipeline's step timeout
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
            recovery: None,
            gate: false,
            retry_policy: None,
            timeout: None,
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = true;
        self
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryHandler>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("gate", &self.gate)
            .field("has_recovery", &self.recovery.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Defaults applied to steps that do not override them
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub retry_policy: RetryPolicy,
    pub step_timeout: Option<Duration>,
}

/// Passed to the `on_step_complete` hook after a step succeeds or recovers
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub step_name: String,
    pub index: usize,
    pub state: StepState,
    pub attempts: u32,
    /// Pipeline state right after the step was recorded
    pub snapshot: PipelineSnapshot,
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Failed {
        step: Option<String>,
        error: WorkflowError,
    },
    Cancelled {
        reason: String,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    /// Terminal status string this outcome corresponds to
    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed => STATUS_COMPLETED,
            RunOutcome::Failed { .. } => STATUS_FAILED,
            RunOutcome::Cancelled { .. } => STATUS_CANCELLED,
        }
    }
}

type StepCompleteHook = Arc<dyn Fn(&StepCompletion) + Send + Sync>;

struct RunState {
    engine: WorkflowEngine,
    current_step_index: usize,
    step_states: Vec<StepRecord>,
    signal: CancellationToken,
}

impl RunState {
    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            current_step_index: self.current_step_index,
            step_states: self.step_states.clone(),
            workflow_snapshot: self.engine.snapshot(),
        }
    }

    fn skip_pending(&mut self) {
        for record in &mut self.step_states {
            if record.state == StepState::Pending {
                record.state = StepState::Skipped;
            }
        }
    }

    fn last_detail(&self) -> Option<String> {
        self.engine
            .history()
            .last()
            .and_then(|event| event.detail.clone())
    }

    /// Outcome implied by a terminal engine status, if any
    fn terminal_outcome(&self) -> Option<RunOutcome> {
        match self.engine.parsed_status().phase {
            Phase::Completed => Some(RunOutcome::Completed),
            Phase::Cancelled => Some(RunOutcome::Cancelled {
                reason: self
                    .last_detail()
                    .unwrap_or_else(|| STATUS_CANCELLED.to_string()),
            }),
            Phase::Failed => Some(self.recorded_failure()),
            _ => None,
        }
    }

    /// Rebuild the failure cause from the history of a failed run
    fn recorded_failure(&self) -> RunOutcome {
        let failed = self
            .step_states
            .iter()
            .find(|record| record.state == StepState::Failed);
        let step = failed.map(|record| record.name.clone());
        let name = step.clone().unwrap_or_default();
        let last = self.engine.history().last();
        let detail = self
            .last_detail()
            .unwrap_or_else(|| STATUS_FAILED.to_string());

        let error = match last.map(|event| &event.cause) {
            Some(TransitionCause::GateRejected) => WorkflowError::GateRejected {
                step: name,
                reason: detail,
            },
            Some(TransitionCause::RecoveryExhausted) => WorkflowError::RecoveryExhausted {
                step: name,
                attempts: failed.map_or(0, |record| record.attempts),
                last: StepFailure::Failed(detail),
            },
            _ => WorkflowError::StepExecutionFailure {
                step: name,
                source: StepFailure::Failed(detail),
            },
        };

        RunOutcome::Failed { step, error }
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, WorkflowError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WorkflowError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct StepEntry {
    index: usize,
    gate: Option<oneshot::Receiver<GateDecision>>,
}

type Step = Result<Option<RunOutcome>, WorkflowError>;

pub struct Pipeline {
    steps: Vec<StepDefinition>,
    options: PipelineOptions,
    on_step_complete: Option<StepCompleteHook>,
    gates: GateKeeper,
    state: Mutex<RunState>,
    running: AtomicBool,
}

impl Pipeline {
    /// Create a pipeline over a fresh engine whose graph is derived from `steps`
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self, WorkflowError> {
        let transitions =
            TransitionMap::for_steps(steps.iter().map(|step| (step.name.as_str(), step.gate)));
        Self::with_engine(steps, WorkflowEngine::new(STATUS_RUNNING, transitions))
    }

    /// Wrap an existing engine; its map must contain every edge `steps` need
    pub fn with_engine(
        steps: Vec<StepDefinition>,
        engine: WorkflowEngine,
    ) -> Result<Self, WorkflowError> {
        PipelineValidator::validate_pipeline(&steps, engine.transitions()).into_result()?;

        let step_states = steps
            .iter()
            .map(|step| StepRecord::pending(step.name.as_str()))
            .collect();

        Ok(Self {
            steps,
            options: PipelineOptions::default(),
            on_step_complete: None,
            gates: GateKeeper::new(),
            state: Mutex::new(RunState {
                engine,
                current_step_index: 0,
                step_states,
                signal: CancellationToken::new(),
            }),
            running: AtomicBool::new(false),
        })
    }

    /// Create a pipeline and put it back where `snapshot` left off
    pub fn resume(
        steps: Vec<StepDefinition>,
        snapshot: PipelineSnapshot,
    ) -> Result<Self, WorkflowError> {
        let pipeline = Self::new(steps)?;
        pipeline.resume_from(snapshot)?;
        Ok(pipeline)
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Result<Self, WorkflowError> {
        PipelineValidator::validate_retry_policy(&options.retry_policy).into_result()?;
        self.options = options;
        Ok(self)
    }

    /// Called after every step that succeeds or recovers, outside the state lock
    pub fn on_step_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StepCompletion) + Send + Sync + 'static,
    {
        self.on_step_complete = Some(Arc::new(hook));
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn status(&self) -> String {
        self.lock_state().engine.status().to_string()
    }

    pub fn step_states(&self) -> Vec<StepRecord> {
        self.lock_state().step_states.clone()
    }

    pub fn current_step_index(&self) -> usize {
        self.lock_state().current_step_index
    }

    pub fn history(&self) -> Vec<TransitionEvent> {
        self.lock_state().engine.history().to_vec()
    }

    /// Root cursor over the run's data
    pub fn cursor(&self) -> DataCursor {
        self.lock_state().engine.cursor()
    }

    pub fn pending_gates(&self) -> Vec<GateRequest> {
        self.gates.pending()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TransitionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.lock_state().engine.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.lock_state().engine.unsubscribe(id)
    }

    /// Drive the steps from the current index until a terminal status
    ///
    /// Step failures, rejections and cancellation are reported through the
    /// returned [`RunOutcome`]; `Err` is reserved for contract violations
    /// such as illegal transitions or a second concurrent `run`.
    pub async fn run(&self) -> Result<RunOutcome, WorkflowError> {
        let _guard = RunGuard::acquire(&self.running)?;

        loop {
            let entry = {
                let mut state = self.lock_state();
                if let Some(outcome) = state.terminal_outcome() {
                    return Ok(outcome);
                }
                if state.current_step_index >= self.steps.len() {
                    state
                        .engine
                        .transition(STATUS_COMPLETED, TransitionCause::Completed)?;
                    tracing::info!(steps = self.steps.len(), "Pipeline completed");
                    return Ok(RunOutcome::Completed);
                }
                self.enter_step(&mut state)?
            };

            if let Some(rx) = entry.gate {
                if let Some(outcome) = self.await_gate(entry.index, rx).await? {
                    return Ok(outcome);
                }
            }

            if let Some(outcome) = self.execute_step(entry.index).await? {
                return Ok(outcome);
            }
        }
    }

    fn enter_step(&self, state: &mut RunState) -> Result<StepEntry, WorkflowError> {
        let index = state.current_step_index;
        let step = &self.steps[index];
        let running = running_status(&step.name);
        let gate = gate_status(&step.name);

        // Resumed while waiting for approval
        if state.engine.status() == gate {
            state.step_states[index].state = StepState::Gated;
            return Ok(StepEntry {
                index,
                gate: Some(self.gates.open(&step.name)),
            });
        }

        // Resumed while the executor was in flight; run it again in place
        if state.engine.status() == running && state.step_states[index].state == StepState::Running
        {
            tracing::info!(step = step.name.as_str(), "Re-running interrupted step");
            return Ok(StepEntry { index, gate: None });
        }

        if step.gate {
            let rx = self.gates.open(&step.name);
            if let Err(e) = state.engine.transition(&gate, TransitionCause::GateOpened) {
                self.gates.discard(&step.name);
                return Err(e);
            }
            state.step_states[index].state = StepState::Gated;
            return Ok(StepEntry {
                index,
                gate: Some(rx),
            });
        }

        state
            .engine
            .transition(&running, TransitionCause::StepStarted)?;
        state.step_states[index].state = StepState::Running;
        tracing::info!(step = step.name.as_str(), index, "Step started");

        Ok(StepEntry { index, gate: None })
    }

    async fn await_gate(
        &self,
        index: usize,
        mut rx: oneshot::Receiver<GateDecision>,
    ) -> Step {
        let step = &self.steps[index];
        let signal = self.lock_state().signal.clone();

        loop {
            let decision = tokio::select! {
                decision = &mut rx => decision.ok(),
                _ = signal.cancelled() => None,
            };

            let mut state = self.lock_state();
            if let Some(outcome) = state.terminal_outcome() {
                return Ok(Some(outcome));
            }

            match decision {
                Some(GateDecision::Approved) => {
                    state
                        .engine
                        .transition(&running_status(&step.name), TransitionCause::GateApproved)?;
                    state.step_states[index].state = StepState::Running;
                    tracing::info!(step = step.name.as_str(), "Gate approved");
                    return Ok(None);
                }
                Some(GateDecision::Rejected(reason)) => {
                    state.engine.transition_with_detail(
                        STATUS_FAILED,
                        TransitionCause::GateRejected,
                        Some(reason.clone()),
                    )?;
                    state.step_states[index].state = StepState::Failed;
                    state.skip_pending();
                    tracing::warn!(step = step.name.as_str(), reason = reason.as_str(), "Gate rejected");

                    return Ok(Some(RunOutcome::Failed {
                        step: Some(step.name.clone()),
                        error: WorkflowError::GateRejected {
                            step: step.name.clone(),
                            reason,
                        },
                    }));
                }
                None => {
                    // Channel dropped without a decision and the run is still live
                    rx = self.gates.open(&step.name);
                }
            }
        }
    }

    async fn execute_step(&self, index: usize) -> Step {
        let step = &self.steps[index];
        let policy = step
            .retry_policy
            .as_ref()
            .unwrap_or(&self.options.retry_policy);
        let max_attempts = policy.max_attempts.max(1);
        let timeout = step.timeout.or(self.options.step_timeout);
        let mut attempt = 1;

        loop {
            let ctx = {
                let mut state = self.lock_state();
                if let Some(outcome) = state.terminal_outcome() {
                    return Ok(Some(outcome));
                }
                state.step_states[index].attempts = attempt;
                StepContext::new(
                    step.name.as_str(),
                    index,
                    attempt,
                    state.engine.cursor(),
                    state.step_states[..index].to_vec().into(),
                    state.signal.clone(),
                )
            };

            tracing::debug!(step = step.name.as_str(), attempt, max_attempts, "Executing step");

            let failure = match invoke(step.executor.as_ref(), ctx, timeout).await {
                Ok(()) => return self.finish_step(index, StepState::Succeeded, attempt),
                Err(failure) => failure,
            };

            if let Some(outcome) = self.lock_state().terminal_outcome() {
                return Ok(Some(outcome));
            }
            tracing::warn!(step = step.name.as_str(), attempt, error = %failure, "Step failed");

            let Some(recovery) = &step.recovery else {
                return self.fail_step(
                    index,
                    WorkflowError::StepExecutionFailure {
                        step: step.name.clone(),
                        source: failure,
                    },
                );
            };

            let cursor = self.cursor();
            match recovery.recover(&failure, attempt, &cursor).await {
                Ok(RecoveryOutcome::Recovered) => {
                    tracing::info!(step = step.name.as_str(), attempt, "Step recovered");
                    return self.finish_step(index, StepState::Recovered, attempt);
                }
                Ok(RecoveryOutcome::Retry) if attempt < max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::info!(
                        step = step.name.as_str(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying step"
                    );
                    if !delay.is_zero() {
                        let signal = self.lock_state().signal.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = signal.cancelled() => {}
                        }
                    }
                    attempt += 1;
                }
                Ok(RecoveryOutcome::Retry) => {
                    return self.fail_step(
                        index,
                        WorkflowError::RecoveryExhausted {
                            step: step.name.clone(),
                            attempts: attempt,
                            last: failure,
                        },
                    );
                }
                Ok(RecoveryOutcome::Fail) => {
                    return self.fail_step(
                        index,
                        WorkflowError::StepExecutionFailure {
                            step: step.name.clone(),
                            source: failure,
                        },
                    );
                }
                Err(recovery_failure) => {
                    tracing::warn!(
                        step = step.name.as_str(),
                        error = %recovery_failure,
                        "Recovery failed"
                    );
                    return self.fail_step(
                        index,
                        WorkflowError::RecoveryFailed {
                            step: step.name.clone(),
                            failure,
                            source: recovery_failure,
                        },
                    );
                }
            }
        }
    }

    fn finish_step(&self, index: usize, outcome: StepState, attempts: u32) -> Step {
        let step = &self.steps[index];
        let completion = {
            let mut state = self.lock_state();
            if let Some(terminal) = state.terminal_outcome() {
                return Ok(Some(terminal));
            }
            state.step_states[index].state = outcome;
            state.current_step_index = index + 1;

            StepCompletion {
                step_name: step.name.clone(),
                index,
                state: outcome,
                attempts,
                snapshot: state.snapshot(),
            }
        };

        tracing::info!(step = step.name.as_str(), state = ?outcome, attempts, "Step finished");

        if let Some(hook) = &self.on_step_complete {
            hook(&completion);
        }
        Ok(None)
    }

    fn fail_step(&self, index: usize, error: WorkflowError) -> Step {
        let step = &self.steps[index];
        let mut state = self.lock_state();
        if let Some(terminal) = state.terminal_outcome() {
            return Ok(Some(terminal));
        }

        let (cause, detail) = match &error {
            WorkflowError::RecoveryExhausted { last, .. } => {
                (TransitionCause::RecoveryExhausted, last.to_string())
            }
            WorkflowError::StepExecutionFailure { source, .. } => {
                (TransitionCause::StepFailed, source.to_string())
            }
            WorkflowError::RecoveryFailed {
                failure, source, ..
            } => (
                TransitionCause::StepFailed,
                format!("{} (step failure: {})", source, failure),
            ),
            other => (TransitionCause::StepFailed, other.to_string()),
        };

        state
            .engine
            .transition_with_detail(STATUS_FAILED, cause, Some(detail))?;
        state.step_states[index].state = StepState::Failed;
        state.skip_pending();
        tracing::error!(step = step.name.as_str(), error = %error, "Pipeline failed");

        Ok(Some(RunOutcome::Failed {
            step: Some(step.name.clone()),
            error,
        }))
    }

    /// Approve the gate `step_name` is waiting on
    pub fn approve(&self, step_name: &str) -> Result<(), WorkflowError> {
        self.resolve_gate(step_name, GateDecision::Approved)
    }

    /// Reject the gate `step_name` is waiting on; the run ends `failed`
    pub fn reject(&self, step_name: &str, reason: impl Into<String>) -> Result<(), WorkflowError> {
        self.resolve_gate(step_name, GateDecision::Rejected(reason.into()))
    }

    fn resolve_gate(&self, step_name: &str, decision: GateDecision) -> Result<(), WorkflowError> {
        if !self.steps.iter().any(|step| step.name == step_name) {
            return Err(WorkflowError::UnknownStep(step_name.to_string()));
        }

        let state = self.lock_state();
        let status = state.engine.status();
        if status != gate_status(step_name) || !self.gates.resolve(step_name, decision) {
            return Err(WorkflowError::NotGated {
                step: step_name.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Move to `cancelled` from any non-terminal status
    ///
    /// Returns false when the run had already ended. An in-flight executor is
    /// not interrupted; it sees the signal in its context.
    pub fn cancel(&self, reason: impl Into<String>) -> Result<bool, WorkflowError> {
        let reason = reason.into();
        {
            let mut state = self.lock_state();
            if state.engine.is_terminal() {
                return Ok(false);
            }

            state.engine.transition_with_detail(
                STATUS_CANCELLED,
                TransitionCause::Cancelled,
                Some(reason.clone()),
            )?;
            for record in &mut state.step_states {
                if record.state.is_active() {
                    record.state = StepState::Cancelled;
                }
            }
            state.skip_pending();
            state.signal.cancel();
        }

        self.gates.close_all();
        tracing::info!(reason = reason.as_str(), "Pipeline cancelled");
        Ok(true)
    }

    /// Capture step index, step states and engine state as one unit
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.lock_state().snapshot()
    }

    /// Replace the pipeline's position with `snapshot`
    ///
    /// Fails with `SnapshotMismatch` when the recorded step list, step index
    /// and engine status do not agree with each other and with this pipeline.
    pub fn resume_from(&self, snapshot: PipelineSnapshot) -> Result<(), WorkflowError> {
        if self.is_running() {
            return Err(WorkflowError::AlreadyRunning);
        }
        check_snapshot(&self.steps, &snapshot)?;

        let index = snapshot.current_step_index;
        {
            let mut state = self.lock_state();
            state.engine.restore(snapshot.workflow_snapshot);
            state.current_step_index = index;
            state.step_states = snapshot.step_states;
            state.signal = CancellationToken::new();
        }
        self.gates.close_all();

        tracing::info!(index, status = self.status().as_str(), "Pipeline resumed from snapshot");
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps)
            .field("options", &self.options)
            .field("status", &self.status())
            .finish()
    }
}

async fn invoke(
    executor: &dyn StepExecutor,
    ctx: StepContext,
    timeout: Option<Duration>,
) -> StepResult {
    let execution = executor.execute(ctx);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, execution)
            .await
            .unwrap_or(Err(StepFailure::TimedOut(limit))),
        None => execution.await,
    }
}

fn mismatch(detail: String) -> Result<(), WorkflowError> {
    Err(WorkflowError::SnapshotMismatch(detail))
}

fn check_snapshot(steps: &[StepDefinition], snapshot: &PipelineSnapshot) -> Result<(), WorkflowError> {
    let states = &snapshot.step_states;
    let index = snapshot.current_step_index;

    if states.len() != steps.len() {
        return mismatch(format!(
            "snapshot records {} steps, pipeline has {}",
            states.len(),
            steps.len()
        ));
    }
    if let Some((step, record)) = steps
        .iter()
        .zip(states)
        .find(|(step, record)| step.name != record.name)
    {
        return mismatch(format!(
            "snapshot records step '{}' where '{}' is defined",
            record.name, step.name
        ));
    }
    if index > steps.len() {
        return mismatch(format!("step index {} is out of range", index));
    }
    if let Some(record) = states[..index].iter().find(|r| !r.state.is_success()) {
        return mismatch(format!(
            "step '{}' before index {} is {:?}",
            record.name, index, record.state
        ));
    }

    let state_at = |i: usize| states.get(i).map(|record| record.state);
    let name_at = |i: usize| steps.get(i).map(|step| step.name.as_str());
    let parsed = parse_status(snapshot.status());

    let consistent = match (&parsed.phase, parsed.step.as_deref()) {
        (Phase::Running, None) => {
            index == 0 && states.iter().all(|r| r.state == StepState::Pending)
        }
        (Phase::Running, Some(step)) => {
            let in_flight =
                name_at(index) == Some(step) && state_at(index) == Some(StepState::Running);
            let between = index > 0
                && name_at(index - 1) == Some(step)
                && matches!(state_at(index), None | Some(StepState::Pending));
            in_flight || between
        }
        (Phase::Gate, Some(step)) => {
            name_at(index) == Some(step) && state_at(index) == Some(StepState::Gated)
        }
        (Phase::Completed, None) => index == steps.len(),
        (Phase::Failed, None) => state_at(index) == Some(StepState::Failed),
        (Phase::Cancelled, None) => matches!(
            state_at(index),
            None | Some(StepState::Cancelled) | Some(StepState::Skipped)
        ),
        _ => false,
    };

    if !consistent {
        return mismatch(format!(
            "status '{}' does not match step index {}",
            snapshot.status(),
            index
        ));
    }

    // Steps after the current one never started: still pending, or skipped
    // once the run ended early
    let expected_tail = match parsed.phase {
        Phase::Failed | Phase::Cancelled => StepState::Skipped,
        _ => StepState::Pending,
    };
    if let Some(record) = states
        .iter()
        .skip(index + 1)
        .find(|record| record.state != expected_tail)
    {
        return mismatch(format!(
            "step '{}' after index {} is {:?} under status '{}', expected {:?}",
            record.name,
            index,
            record.state,
            snapshot.status(),
            expected_tail
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::executor::step_fn;

    fn noop(name: &str) -> StepDefinition {
        StepDefinition::new(name, step_fn(|_ctx: StepContext| async { Ok(()) }))
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let err = Pipeline::new(vec![noop("a"), noop("a")]).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPipeline(_)));
    }

    #[test]
    fn test_wrapped_engine_must_cover_step_graph() {
        let engine = WorkflowEngine::new(
            STATUS_RUNNING,
            TransitionMap::new().allow("running", "running:a"),
        );
        let err = Pipeline::with_engine(vec![noop("a")], engine).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPipeline(_)));
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let pipeline = Pipeline::new(Vec::new()).unwrap();
        let outcome = pipeline.run().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(pipeline.status(), "completed");
    }

    #[tokio::test]
    async fn test_run_after_terminal_returns_outcome_again() {
        let pipeline = Pipeline::new(vec![noop("a")]).unwrap();
        pipeline.run().await.unwrap();

        let again = pipeline.run().await.unwrap();
        assert!(again.is_completed());
        assert_eq!(pipeline.history().len(), 2);
    }

    #[test]
    fn test_cancel_before_run_skips_everything() {
        let pipeline = Pipeline::new(vec![noop("a"), noop("b")]).unwrap();
        assert!(pipeline.cancel("not needed").unwrap());
        assert!(!pipeline.cancel("again").unwrap());

        let states: Vec<_> = pipeline.step_states().iter().map(|r| r.state).collect();
        assert_eq!(states, vec![StepState::Skipped, StepState::Skipped]);
        assert_eq!(pipeline.status(), "cancelled");
    }

    #[test]
    fn test_snapshot_of_other_pipeline_is_rejected() {
        let first = Pipeline::new(vec![noop("a"), noop("b")]).unwrap();
        let second = Pipeline::new(vec![noop("a"), noop("c")]).unwrap();

        let err = second.resume_from(first.snapshot()).unwrap_err();
        assert!(matches!(err, WorkflowError::SnapshotMismatch(_)));
    }

    #[test]
    fn test_approve_unknown_step() {
        let pipeline = Pipeline::new(vec![noop("a")]).unwrap();
        assert!(matches!(
            pipeline.approve("zzz"),
            Err(WorkflowError::UnknownStep(_))
        ));
        assert!(matches!(
            pipeline.approve("a"),
            Err(WorkflowError::NotGated { .. })
        ));
    }
}
