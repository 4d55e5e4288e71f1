//! YAML pipeline manifests

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use steprail_core::models::workflow::RetryPolicy;
use steprail_core::workflow::{
    BashStep, PipelineValidator, RetryOnFailure, StepDefinition, ValidationResult,
};

/// A named list of shell steps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<ManifestStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestStep {
    pub name: String,
    /// Run with `bash -c`
    pub command: String,
    /// Wait for operator approval before running
    #[serde(default)]
    pub gate: bool,
    /// Retry failures under the pipeline's default policy
    #[serde(default)]
    pub retry: bool,
    /// Retry failures with this policy instead of the default one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ManifestStep {
    fn definition(&self) -> StepDefinition {
        let mut step = StepDefinition::new(self.name.as_str(), Arc::new(BashStep::new(&self.command)));
        if self.gate {
            step = step.gated();
        }
        if self.retry || self.retry_policy.is_some() {
            step = step.with_recovery(Arc::new(RetryOnFailure));
        }
        if let Some(policy) = &self.retry_policy {
            step = step.with_retry_policy(policy.clone());
        }
        if let Some(seconds) = self.timeout_seconds {
            step = step.with_timeout(Duration::from_secs(seconds));
        }
        step
    }
}

impl PipelineManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse manifest YAML")
    }

    pub fn step_definitions(&self) -> Vec<StepDefinition> {
        self.steps.iter().map(ManifestStep::definition).collect()
    }

    /// Structural checks on top of the pipeline's own validation
    pub fn validate(&self) -> ValidationResult {
        let mut result = PipelineValidator::validate_step_names(
            self.steps.iter().map(|step| step.name.as_str()),
        );

        if self.name.trim().is_empty() {
            result.add_error("name", "Pipeline name cannot be empty");
        }
        if self.steps.is_empty() {
            result.add_warning("Pipeline has no steps and completes immediately");
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.command.trim().is_empty() {
                result.add_error(format!("steps[{}].command", index), "command cannot be empty");
            }
            if step.timeout_seconds == Some(0) {
                result.add_error(
                    format!("steps[{}].timeout_seconds", index),
                    "timeout_seconds must be greater than zero",
                );
            }
            if let Some(policy) = &step.retry_policy {
                result.merge(
                    &format!("steps[{}].retry_policy", index),
                    PipelineValidator::validate_retry_policy(policy),
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: release
description: Build and ship
steps:
  - name: build
    command: make build
    timeout_seconds: 600
  - name: fetch
    command: ./fetch.sh
    retry: true
  - name: deploy
    command: ./deploy.sh
    gate: true
    retry_policy:
      max_attempts: 3
      initial_delay_ms: 500
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();

        assert_eq!(manifest.name, "release");
        assert_eq!(manifest.steps.len(), 3);
        assert!(!manifest.steps[0].gate);
        assert!(manifest.steps[1].retry);
        assert_eq!(
            manifest.steps[2].retry_policy.as_ref().unwrap().initial_delay_ms,
            500
        );
        assert!(manifest.validate().is_valid());
    }

    #[test]
    fn test_step_definitions_carry_options() {
        let manifest = PipelineManifest::from_yaml(MANIFEST).unwrap();
        let steps = manifest.step_definitions();

        assert_eq!(steps[0].timeout, Some(Duration::from_secs(600)));
        assert!(steps[0].recovery.is_none());
        // Default policy comes from the pipeline options
        assert!(steps[1].recovery.is_some());
        assert!(steps[1].retry_policy.is_none());
        assert!(steps[2].gate);
        assert!(steps[2].recovery.is_some());
        assert!(steps[2].retry_policy.is_some());
    }

    #[test]
    fn test_validation_errors() {
        let manifest = PipelineManifest::from_yaml(
            r#"
name: ""
steps:
  - name: a
    command: "  "
  - name: a
    command: echo
    timeout_seconds: 0
"#,
        )
        .unwrap();

        let fields: Vec<_> = manifest
            .validate()
            .errors
            .into_iter()
            .map(|e| e.field)
            .collect();
        assert!(fields.contains(&"name".to_string()));
        assert!(fields.contains(&"steps[0].command".to_string()));
        assert!(fields.contains(&"steps[1].name".to_string()));
        assert!(fields.contains(&"steps[1].timeout_seconds".to_string()));
    }

    #[test]
    fn test_missing_steps_is_parse_error() {
        assert!(PipelineManifest::from_yaml("name: x\n").is_err());
    }
}
