//! `phase:step` status strings
//!
//! The status string is the only externally observed form of pipeline
//! progress. Parsing is total: anything unrecognized degenerates to a phase
//! holding the whole trimmed input.

use crate::models::workflow::{ParsedStatus, Phase};

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Parse a status string into phase and optional step
pub fn parse_status(input: &str) -> ParsedStatus {
    let trimmed = input.trim();

    match trimmed.split_once(':') {
        Some((phase, step)) => ParsedStatus {
            phase: Phase::from(phase),
            step: (!step.is_empty()).then(|| step.to_string()),
        },
        None => ParsedStatus {
            phase: Phase::from(trimmed),
            step: None,
        },
    }
}

/// Build a status string; inverse of [`parse_status`]
pub fn format_status(phase: &Phase, step: Option<&str>) -> String {
    match step {
        Some(step) if !step.is_empty() => format!("{}:{}", phase, step),
        _ => phase.to_string(),
    }
}

pub fn running_status(step: &str) -> String {
    format_status(&Phase::Running, Some(step))
}

pub fn gate_status(step: &str) -> String {
    format_status(&Phase::Gate, Some(step))
}
