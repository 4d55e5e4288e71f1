//! Status string grammar

use steprail_core::models::workflow::{ParsedStatus, Phase};
use steprail_core::workflow::status::{format_status, parse_status};

#[test]
fn test_round_trip_for_every_phase() {
    let statuses = [
        ParsedStatus::new(Phase::Running, None),
        ParsedStatus::new(Phase::Running, Some("create_plan")),
        ParsedStatus::new(Phase::Gate, Some("approve")),
        ParsedStatus::new(Phase::Completed, None),
        ParsedStatus::new(Phase::Failed, None),
        ParsedStatus::new(Phase::Cancelled, None),
    ];

    for status in statuses {
        let formatted = format_status(&status.phase, status.step.as_deref());
        assert_eq!(parse_status(&formatted), status, "round trip of '{}'", formatted);
    }
}

#[test]
fn test_documented_examples() {
    assert_eq!(
        parse_status("running:create_plan"),
        ParsedStatus::new(Phase::Running, Some("create_plan"))
    );
    assert_eq!(
        parse_status("gate:approve"),
        ParsedStatus::new(Phase::Gate, Some("approve"))
    );
    assert_eq!(parse_status("completed"), ParsedStatus::new(Phase::Completed, None));
}

#[test]
fn test_empty_step_is_normalized_away() {
    let parsed = parse_status("running:");
    assert_eq!(parsed.phase, Phase::Running);
    assert_eq!(parsed.step, None);
}

#[test]
fn test_surrounding_whitespace_is_trimmed() {
    assert_eq!(
        parse_status("  gate:approve  "),
        ParsedStatus::new(Phase::Gate, Some("approve"))
    );
}

#[test]
fn test_unknown_phase_is_kept_verbatim() {
    let parsed = parse_status("paused:deploy");
    assert_eq!(parsed.phase, Phase::Other("paused".to_string()));
    assert_eq!(parsed.to_string(), "paused:deploy");
}

#[test]
fn test_terminal_phases() {
    assert!(parse_status("completed").phase.is_terminal());
    assert!(parse_status("failed").phase.is_terminal());
    assert!(parse_status("cancelled").phase.is_terminal());
    assert!(!parse_status("gate:x").phase.is_terminal());
}
