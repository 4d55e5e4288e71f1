//! Pipeline validation logic

use crate::error::WorkflowError;
use crate::models::workflow::RetryPolicy;
use crate::workflow::pipeline::StepDefinition;
use crate::workflow::transitions::TransitionMap;
use std::collections::HashSet;

/// Longest initial retry delay accepted, in milliseconds
pub const MAX_INITIAL_DELAY_MS: u64 = 300_000;

/// Validation error type
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Fold another result in, prefixing its error fields
    pub fn merge(&mut self, prefix: &str, other: ValidationResult) {
        for error in other.errors {
            self.add_error(format!("{}.{}", prefix, error.field), error.message);
        }
        for warning in other.warnings {
            self.add_warning(format!("{}: {}", prefix, warning));
        }
    }

    /// Log warnings and turn errors into `InvalidPipeline`
    pub fn into_result(self) -> Result<(), WorkflowError> {
        for warning in &self.warnings {
            tracing::warn!(warning = warning.as_str(), "Pipeline validation warning");
        }
        if self.is_valid() {
            return Ok(());
        }

        let message = self
            .errors
            .iter()
            .map(|error| format!("{}: {}", error.field, error.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(WorkflowError::InvalidPipeline(message))
    }
}

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate retry policy
    /// - max_attempts: 1-10
    /// - initial_delay_ms: at most 300s
    /// - backoff_multiplier >= 1.0
    pub fn validate_retry_policy(policy: &RetryPolicy) -> ValidationResult {
        let mut result = ValidationResult::new();

        if policy.max_attempts < 1 {
            result.add_error("max_attempts", "max_attempts must be at least 1");
        }
        if policy.max_attempts > 10 {
            result.add_error("max_attempts", "max_attempts cannot exceed 10");
        }

        if policy.initial_delay_ms > MAX_INITIAL_DELAY_MS {
            result.add_error(
                "initial_delay_ms",
                format!("initial_delay_ms cannot exceed {}", MAX_INITIAL_DELAY_MS),
            );
        }

        if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
            result.add_error(
                "backoff_multiplier",
                "backoff_multiplier must be at least 1.0",
            );
        }

        // Warn if exponential backoff might exceed max delay quickly
        if policy.exponential_backoff && policy.backoff_multiplier > 3.0 {
            result.add_warning(format!(
                "High backoff_multiplier ({}) with exponential backoff may reach max delay (600s) quickly",
                policy.backoff_multiplier
            ));
        }

        result
    }

    /// Names must be non-empty, trimmed, free of `:` and unique
    pub fn validate_step_names<'a>(names: impl IntoIterator<Item = &'a str>) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut seen = HashSet::new();

        for (index, name) in names.into_iter().enumerate() {
            let field = format!("steps[{}].name", index);
            if name.trim().is_empty() {
                result.add_error(field, "step name cannot be empty");
                continue;
            }
            if name.trim() != name {
                result.add_error(
                    field.clone(),
                    format!("step name '{}' has surrounding whitespace", name),
                );
            }
            if name.contains(':') {
                result.add_error(
                    field.clone(),
                    format!("step name '{}' cannot contain ':'", name),
                );
            }
            if !seen.insert(name) {
                result.add_error(field, format!("duplicate step name '{}'", name));
            }
        }

        result
    }

    /// Every edge the step sequence walks must exist in `transitions`
    pub fn validate_transition_coverage(
        steps: &[StepDefinition],
        transitions: &TransitionMap,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();
        let required =
            TransitionMap::for_steps(steps.iter().map(|step| (step.name.as_str(), step.gate)));

        for (from, to) in transitions.missing_edges(&required) {
            result.add_error(
                "transitions",
                format!("missing transition '{}' -> '{}'", from, to),
            );
        }

        result
    }

    /// Validate a step list against the engine it will drive
    pub fn validate_pipeline(
        steps: &[StepDefinition],
        transitions: &TransitionMap,
    ) -> ValidationResult {
        let mut result =
            Self::validate_step_names(steps.iter().map(|step| step.name.as_str()));

        for (index, step) in steps.iter().enumerate() {
            if let Some(policy) = &step.retry_policy {
                result.merge(
                    &format!("steps[{}].retry_policy", index),
                    Self::validate_retry_policy(policy),
                );
            }
            if step.timeout.is_some_and(|timeout| timeout.is_zero()) {
                result.add_error(
                    format!("steps[{}].timeout", index),
                    "timeout must be greater than zero",
                );
            }
            if step.retry_policy.is_some() && step.recovery.is_none() {
                result.add_warning(format!(
                    "Step '{}' has a retry policy but no recovery handler; it will never retry",
                    step.name
                ));
            }
        }

        // Coverage is meaningless when names are already broken
        if result.is_valid() {
            let coverage = Self::validate_transition_coverage(steps, transitions);
            result.errors.extend(coverage.errors);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(PipelineValidator::validate_retry_policy(&RetryPolicy::default()).is_valid());
    }

    #[test]
    fn test_policy_bounds() {
        let policy = RetryPolicy {
            max_attempts: 11,
            backoff_multiplier: 0.5,
            ..RetryPolicy::default()
        };
        let result = PipelineValidator::validate_retry_policy(&policy);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_step_name_rules() {
        let result = PipelineValidator::validate_step_names(["plan", "", " pad", "a:b", "plan"]);
        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["steps[1].name", "steps[2].name", "steps[3].name", "steps[4].name"]
        );
    }

    #[test]
    fn test_into_result_joins_errors() {
        let mut result = ValidationResult::new();
        result.add_error("a", "bad");
        result.add_error("b", "worse");
        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Invalid pipeline: a: bad; b: worse");
    }
}
