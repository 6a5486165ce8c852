//! Result types handed to the report sink. One `NodeGroupResult` is produced per node group for
//! every scale-down or scale-up, including synthetic entries when the whole run failed early.
use crate::capacity::NodeGroupCapacity;

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Duration;

/// Name used for the synthetic result when no node group could be examined.
pub const CLUSTER_WIDE_RESULT: &str = "*";

/// The outcome of a best-effort step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { error: String },
    TimedOut { elapsed_secs: u64 },
    DryRun,
}

impl StepOutcome {
    pub fn failed<E: fmt::Display>(error: E) -> Self {
        StepOutcome::Failed {
            error: error.to_string(),
        }
    }

    pub fn skipped<S: Into<String>>(reason: S) -> Self {
        StepOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        StepOutcome::TimedOut {
            elapsed_secs: elapsed.as_secs(),
        }
    }

    /// Whether the step left the cluster in the state it was asked for.
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded | StepOutcome::DryRun)
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Succeeded => write!(f, "succeeded"),
            StepOutcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            StepOutcome::Failed { error } => write!(f, "failed: {}", error),
            StepOutcome::TimedOut { elapsed_secs } => {
                write!(f, "timed out after {}s", elapsed_secs)
            }
            StepOutcome::DryRun => write!(f, "dry run"),
        }
    }
}

/// The per-node-group report of a lifecycle run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupResult {
    pub node_group: String,
    pub previous_capacity: String,
    pub current_capacity: String,
    pub autoscaler_managed: bool,
    pub webhook_managed: bool,
    pub pods_drained: bool,
    pub bootstrap_validated: bool,
    pub dependencies_validated: bool,
    /// Degraded steps that did not stop the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeGroupResult {
    pub fn new<S: Into<String>>(node_group: S) -> Self {
        NodeGroupResult {
            node_group: node_group.into(),
            ..Default::default()
        }
    }

    /// A result standing in for every node group when the run could not start.
    pub fn synthetic_failure<E: fmt::Display>(error: E) -> Self {
        NodeGroupResult {
            node_group: CLUSTER_WIDE_RESULT.to_string(),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn with_previous(mut self, capacity: &NodeGroupCapacity) -> Self {
        self.previous_capacity = capacity.to_string();
        self
    }

    pub fn set_current(&mut self, capacity: &NodeGroupCapacity) {
        self.current_capacity = capacity.to_string();
    }

    pub fn push_warning<W: fmt::Display>(&mut self, warning: W) {
        self.warnings.push(warning.to_string());
    }

    /// Records an error, keeping any earlier one first.
    pub fn push_error<E: fmt::Display>(&mut self, error: E) {
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{}; {}", existing, error),
            None => error.to_string(),
        });
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_errors_accumulate_in_order() {
        let mut result = NodeGroupResult::new("ng-a");
        assert!(result.is_success());
        result.push_error("drain incomplete");
        result.push_error("update failed");
        assert_eq!(
            result.error.as_deref(),
            Some("drain incomplete; update failed")
        );
    }

    #[test]
    fn test_serialized_shape() {
        let previous = NodeGroupCapacity::new(2, 6, 3);
        let mut result = NodeGroupResult::new("ng-a").with_previous(&previous);
        result.set_current(&NodeGroupCapacity::new(0, 6, 0));
        result.pods_drained = true;

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["previous_capacity"], "min=2, max=6, desired=3");
        assert_eq!(value["current_capacity"], "min=0, max=6, desired=0");
        assert_eq!(value["pods_drained"], true);
        assert!(value.get("error").is_none());
        assert!(value.get("warnings").is_none());

        let timed_out = StepOutcome::timed_out(Duration::from_secs(300));
        let outcome = serde_json::to_value(timed_out).unwrap();
        assert_eq!(outcome["status"], "timed_out");
        assert_eq!(outcome["elapsed_secs"], 300);
    }

    #[test]
    fn test_warnings_do_not_fail_the_result() {
        let mut result = NodeGroupResult::new("ng-a");
        result.push_warning("webhook suppression failed");
        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_synthetic_failure() {
        let result = NodeGroupResult::synthetic_failure("cluster c1 is not ACTIVE");
        assert_eq!(result.node_group, CLUSTER_WIDE_RESULT);
        assert!(!result.is_success());
    }
}
