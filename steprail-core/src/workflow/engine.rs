//! State machine execution engine
//!
//! `WorkflowEngine` owns the current status, the transition graph, the data
//! blob and the append-only transition history. It knows nothing about
//! pipelines: any status graph can be driven through it.

use crate::error::WorkflowError;
use crate::models::workflow::{ParsedStatus, TransitionCause, TransitionEvent, WorkflowSnapshot};
use crate::workflow::cursor::DataCursor;
use crate::workflow::status::parse_status;
use crate::workflow::transitions::TransitionMap;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

/// Observer notified synchronously after every committed transition
///
/// Listeners receive the event only, never the engine, so they cannot
/// re-enter `transition`.
pub type ChangeListener = Box<dyn Fn(&TransitionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Capability returned by [`WorkflowEngine::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct WorkflowEngine {
    /// Current status string
    status: String,
    /// Read-only for the engine's lifetime
    transitions: Arc<TransitionMap>,
    /// Root cursor over the data blob
    cursor: DataCursor,
    /// Realized transitions, oldest first
    history: Vec<TransitionEvent>,
    /// Registered listeners in registration order
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener_id: u64,
}

impl WorkflowEngine {
    /// Create engine at `initial_status` with an empty data object
    pub fn new(initial_status: impl Into<String>, transitions: TransitionMap) -> Self {
        Self {
            status: initial_status.into(),
            transitions: Arc::new(transitions),
            cursor: DataCursor::new(),
            history: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// Seed the data blob
    pub fn with_data(self, data: Value) -> Self {
        self.cursor.replace_root(data);
        self
    }

    /// Rehydrate an engine from a snapshot
    pub fn from_snapshot(snapshot: WorkflowSnapshot, transitions: TransitionMap) -> Self {
        let mut engine = Self::new(snapshot.status.clone(), transitions);
        engine.restore(snapshot);
        engine
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn parsed_status(&self) -> ParsedStatus {
        parse_status(&self.status)
    }

    pub fn transitions(&self) -> &TransitionMap {
        &self.transitions
    }

    pub fn history(&self) -> &[TransitionEvent] {
        &self.history
    }

    /// No outgoing edges from the current status
    pub fn is_terminal(&self) -> bool {
        self.transitions.is_terminal(&self.status)
    }

    pub fn can_transition(&self, to: &str) -> bool {
        self.transitions.allows(&self.status, to)
    }

    /// Move to `to`, failing with `IllegalTransition` if the map forbids it
    pub fn transition(
        &mut self,
        to: &str,
        cause: TransitionCause,
    ) -> Result<TransitionEvent, WorkflowError> {
        self.transition_with_detail(to, cause, None)
    }

    /// Like [`transition`](Self::transition) with a detail message recorded on the event
    pub fn transition_with_detail(
        &mut self,
        to: &str,
        cause: TransitionCause,
        detail: Option<String>,
    ) -> Result<TransitionEvent, WorkflowError> {
        if !self.can_transition(to) {
            return Err(WorkflowError::IllegalTransition {
                from: self.status.clone(),
                to: to.to_string(),
            });
        }

        let event = TransitionEvent {
            id: Uuid::new_v4(),
            from: std::mem::replace(&mut self.status, to.to_string()),
            to: to.to_string(),
            timestamp: Utc::now(),
            cause,
            detail,
        };
        self.history.push(event.clone());

        tracing::debug!(
            from = event.from.as_str(),
            to = event.to.as_str(),
            cause = ?event.cause,
            "Workflow transitioned"
        );

        self.notify(&event);
        Ok(event)
    }

    /// Register a listener; returns the id that deregisters it
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&TransitionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener; false when it was not registered
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deep copy of status, data and history
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            status: self.status.clone(),
            data: self.cursor.to_value(),
            history: self.history.clone(),
        }
    }

    /// Replace status, data and history wholesale without notifying listeners
    pub fn restore(&mut self, snapshot: WorkflowSnapshot) {
        self.status = snapshot.status;
        self.history = snapshot.history;
        self.cursor.replace_root(snapshot.data);
    }

    /// Root cursor; shares the engine's backing data
    pub fn cursor(&self) -> DataCursor {
        self.cursor.clone()
    }

    fn notify(&self, event: &TransitionEvent) {
        for (id, listener) in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        listener = id.0,
                        to = event.to.as_str(),
                        error = %e,
                        "Change listener failed"
                    );
                }
                Err(_) => {
                    tracing::error!(
                        listener = id.0,
                        to = event.to.as_str(),
                        "Change listener panicked"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("status", &self.status)
            .field("history_len", &self.history.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
