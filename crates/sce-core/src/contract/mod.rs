//! Result-summary contract validation and merge-gate evaluation.
//!
//! Runs in two stages on spec completion: validate the agent's payload
//! against the summary schema, then decide whether the completed spec may
//! merge under the coordination policy. Either stage failing converts the
//! spec's outcome from `completed` to `failed`.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use sce_store::models::{CoordinationPolicy, ResultSummary};

static CONFLICT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)conflict|unresolved").expect("conflict pattern is a valid regex")
});

/// A contract violation. Non-retriable: the spec becomes `failed`.
#[derive(Debug, Error)]
pub enum ContractViolation {
    #[error("spec {spec:?} completed without a result summary")]
    MissingSummary { spec: String },

    #[error("result summary for spec {spec:?} is invalid: {reason}")]
    InvalidSummary { spec: String, reason: String },

    #[error("merge blocked for spec {spec:?}: {reason}")]
    MergeBlocked { spec: String, reason: String },
}

/// Evaluates agent result summaries against the coordination policy.
#[derive(Debug, Clone)]
pub struct ContractGate {
    policy: CoordinationPolicy,
}

impl ContractGate {
    pub fn new(policy: CoordinationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CoordinationPolicy {
        &self.policy
    }

    /// Full evaluation: validate the payload, then apply the merge policy.
    ///
    /// When no payload exists and `require_result_summary` is off, a
    /// neutral summary is synthesized and validation passes.
    pub fn evaluate(
        &self,
        spec: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<ResultSummary, ContractViolation> {
        let summary = match payload {
            Some(value) => self.validate(spec, value)?,
            None if !self.policy.require_result_summary => ResultSummary::neutral(spec),
            None => {
                return Err(ContractViolation::MissingSummary {
                    spec: spec.to_owned(),
                });
            }
        };
        self.merge_decision(spec, &summary)?;
        Ok(summary)
    }

    /// Stage one: schema and range validation. Extra fields in the payload
    /// are ignored.
    pub fn validate(
        &self,
        spec: &str,
        payload: serde_json::Value,
    ) -> Result<ResultSummary, ContractViolation> {
        let summary: ResultSummary =
            serde_json::from_value(payload).map_err(|e| ContractViolation::InvalidSummary {
                spec: spec.to_owned(),
                reason: e.to_string(),
            })?;

        if summary.spec_id.trim().is_empty() {
            return Err(ContractViolation::InvalidSummary {
                spec: spec.to_owned(),
                reason: "spec_id must be non-empty".to_owned(),
            });
        }
        if summary.tests_passed > summary.tests_run {
            return Err(ContractViolation::InvalidSummary {
                spec: spec.to_owned(),
                reason: format!(
                    "tests_passed ({}) exceeds tests_run ({})",
                    summary.tests_passed, summary.tests_run
                ),
            });
        }
        Ok(summary)
    }

    /// Stage two: may this completed spec merge?
    pub fn merge_decision(
        &self,
        spec: &str,
        summary: &ResultSummary,
    ) -> Result<(), ContractViolation> {
        if self.policy.block_merge_on_failed_tests && summary.tests_run != summary.tests_passed {
            return Err(ContractViolation::MergeBlocked {
                spec: spec.to_owned(),
                reason: format!(
                    "{} of {} tests failed",
                    summary.tests_run - summary.tests_passed,
                    summary.tests_run
                ),
            });
        }

        if self.policy.block_merge_on_unresolved_conflicts {
            if let Some(issue) = summary
                .open_issues
                .iter()
                .find(|issue| CONFLICT_PATTERN.is_match(issue))
            {
                return Err(ContractViolation::MergeBlocked {
                    spec: spec.to_owned(),
                    reason: format!("unresolved conflict reported: {issue}"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_payload() -> serde_json::Value {
        json!({
            "spec_id": "auth",
            "changed_files": ["src/lib.rs"],
            "tests_run": 12,
            "tests_passed": 12,
            "risk_level": "low",
            "open_issues": []
        })
    }

    fn gate(policy: CoordinationPolicy) -> ContractGate {
        ContractGate::new(policy)
    }

    #[test]
    fn valid_summary_passes() {
        let g = gate(CoordinationPolicy::default());
        let summary = g.evaluate("auth", Some(valid_payload())).unwrap();
        assert_eq!(summary.spec_id, "auth");
        assert_eq!(summary.tests_run, 12);
    }

    #[test]
    fn missing_summary_synthesizes_neutral_when_not_required() {
        let g = gate(CoordinationPolicy::default());
        let summary = g.evaluate("auth", None).unwrap();
        assert_eq!(summary.spec_id, "auth");
        assert_eq!(summary.tests_run, 0);
        assert_eq!(summary.tests_passed, 0);
        assert!(summary.changed_files.is_empty());
    }

    #[test]
    fn missing_summary_fails_when_required() {
        let g = gate(CoordinationPolicy {
            require_result_summary: true,
            ..Default::default()
        });
        let err = g.evaluate("auth", None).unwrap_err();
        assert!(matches!(err, ContractViolation::MissingSummary { .. }));
    }

    #[test]
    fn rejects_missing_required_field() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload.as_object_mut().unwrap().remove("risk_level");
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn rejects_empty_spec_id() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["spec_id"] = json!("  ");
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn rejects_tests_passed_above_tests_run() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["tests_passed"] = json!(13);
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn rejects_negative_counts() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["tests_run"] = json!(-1);
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn rejects_unknown_risk_level() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["risk_level"] = json!("terrifying");
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn rejects_non_array_changed_files() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["changed_files"] = json!("src/lib.rs");
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::InvalidSummary { .. }));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["agent_build"] = json!("2025.1");
        assert!(g.evaluate("auth", Some(payload)).is_ok());
    }

    #[test]
    fn failed_tests_block_merge() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["tests_passed"] = json!(10);
        let err = g.evaluate("auth", Some(payload)).unwrap_err();
        assert!(matches!(err, ContractViolation::MergeBlocked { .. }));
    }

    #[test]
    fn failed_tests_allowed_when_policy_disabled() {
        let g = gate(CoordinationPolicy {
            block_merge_on_failed_tests: false,
            ..Default::default()
        });
        let mut payload = valid_payload();
        payload["tests_passed"] = json!(10);
        assert!(g.evaluate("auth", Some(payload)).is_ok());
    }

    #[test]
    fn conflict_issues_block_merge() {
        let g = gate(CoordinationPolicy::default());
        for issue in ["merge CONFLICT in src/lib.rs", "unresolved question about API"] {
            let mut payload = valid_payload();
            payload["open_issues"] = json!([issue]);
            let err = g.evaluate("auth", Some(payload)).unwrap_err();
            assert!(
                matches!(err, ContractViolation::MergeBlocked { .. }),
                "issue {issue:?} should block"
            );
        }
    }

    #[test]
    fn benign_issues_do_not_block_merge() {
        let g = gate(CoordinationPolicy::default());
        let mut payload = valid_payload();
        payload["open_issues"] = json!(["follow-up: tune cache size"]);
        assert!(g.evaluate("auth", Some(payload)).is_ok());
    }

    #[test]
    fn conflict_issues_allowed_when_policy_disabled() {
        let g = gate(CoordinationPolicy {
            block_merge_on_unresolved_conflicts: false,
            ..Default::default()
        });
        let mut payload = valid_payload();
        payload["open_issues"] = json!(["unresolved conflict"]);
        assert!(g.evaluate("auth", Some(payload)).is_ok());
    }
}
