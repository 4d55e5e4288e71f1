//! # Steprail Core Library
//!
//! Workflow state machine, gated step pipeline, and resumable snapshots.

pub mod error;
pub mod models;
pub mod services;
pub mod workflow;

pub use error::WorkflowError;
