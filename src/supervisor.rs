use crate::agents::{AgentContext, AgentDecision, NEXT_STEP_ESCALATE};
use crate::db::exceptions::{ExceptionRow, Severity};

// key: supervisor -> safety-checkpoints
//
// Reviews the outputs of the policy and resolution stages; intervenes by
// overriding nextStep to ESCALATE. Not an `Agent` impl: reviews take the
// decision under review as an explicit argument.

const DEGRADATION_MARGIN: f64 = 0.2;

pub struct SupervisorAgent {
    min_confidence_threshold: f64,
}

impl SupervisorAgent {
    pub fn new() -> Self {
        Self {
            min_confidence_threshold: 0.6,
        }
    }

    pub fn with_threshold(min_confidence_threshold: f64) -> Self {
        Self {
            min_confidence_threshold,
        }
    }

    /// Checkpoint after PolicyAgent.
    pub fn review_post_policy(
        &self,
        exception: &ExceptionRow,
        policy_decision: &AgentDecision,
        context: &AgentContext,
    ) -> AgentDecision {
        let mut issues = self.check_confidence_chain(context, policy_decision);
        issues.extend(self.check_severity_confidence_mismatch(exception, context, policy_decision));
        issues.extend(self.check_critical_approval(exception, policy_decision));

        self.build_review("post-policy", policy_decision, issues)
    }

    /// Checkpoint after the resolution stage.
    pub fn review_post_resolution(
        &self,
        exception: &ExceptionRow,
        resolution_decision: &AgentDecision,
        context: &AgentContext,
    ) -> AgentDecision {
        let mut issues = self.check_confidence_chain(context, resolution_decision);
        issues.extend(self.check_severity_confidence_mismatch(
            exception,
            context,
            resolution_decision,
        ));
        if exception.severity() == Some(Severity::Critical) && resolution_decision.confidence < 0.8
        {
            issues.push(format!(
                "CRITICAL resolution confidence {:.2} below 0.80",
                resolution_decision.confidence
            ));
        }

        self.build_review("post-resolution", resolution_decision, issues)
    }

    fn check_confidence_chain(
        &self,
        context: &AgentContext,
        current: &AgentDecision,
    ) -> Vec<String> {
        let mut issues = Vec::new();

        if current.confidence < self.min_confidence_threshold {
            issues.push(format!(
                "confidence {:.2} below threshold ({:.2})",
                current.confidence, self.min_confidence_threshold
            ));
        }

        let prior_confidences: Vec<(String, f64)> = context
            .prior_outputs
            .iter()
            .map(|(name, decision)| (name.clone(), decision.confidence))
            .collect();

        for (name, confidence) in &prior_confidences {
            if *confidence < self.min_confidence_threshold {
                issues.push(format!(
                    "{name} confidence {confidence:.2} below threshold ({:.2})",
                    self.min_confidence_threshold
                ));
            }
        }

        if let Some(min_prior) = prior_confidences
            .iter()
            .map(|(_, confidence)| *confidence)
            .fold(None::<f64>, |acc, value| {
                Some(acc.map_or(value, |current_min| current_min.min(value)))
            })
        {
            if current.confidence < min_prior - DEGRADATION_MARGIN {
                issues.push(format!(
                    "confidence degradation: {:.2} dropped more than {DEGRADATION_MARGIN:.1} below prior minimum {:.2}",
                    current.confidence, min_prior
                ));
            }
        }

        issues
    }

    fn check_severity_confidence_mismatch(
        &self,
        exception: &ExceptionRow,
        context: &AgentContext,
        current: &AgentDecision,
    ) -> Vec<String> {
        let mut issues = Vec::new();
        let Some(severity) = exception.severity() else {
            return issues;
        };

        if matches!(severity, Severity::High | Severity::Critical) && current.confidence < 0.7 {
            issues.push(format!(
                "severity {} with confidence {:.2} below 0.70",
                severity.as_str(),
                current.confidence
            ));
        }

        if severity == Severity::Critical {
            for (name, decision) in &context.prior_outputs {
                if decision.confidence < 0.8 {
                    issues.push(format!(
                        "CRITICAL exception but {name} confidence {:.2} below 0.80",
                        decision.confidence
                    ));
                }
            }
        }

        issues
    }

    fn check_critical_approval(
        &self,
        exception: &ExceptionRow,
        policy_decision: &AgentDecision,
    ) -> Vec<String> {
        let mut issues = Vec::new();
        if exception.severity() == Some(Severity::Critical)
            && policy_decision.decision.to_uppercase().contains("ALLOW")
            && !policy_decision.next_step.contains("REQUIRE_APPROVAL")
        {
            issues.push("CRITICAL severity allowed without human approval".to_string());
        }
        issues
    }

    fn build_review(
        &self,
        checkpoint: &str,
        reviewed: &AgentDecision,
        issues: Vec<String>,
    ) -> AgentDecision {
        let mut evidence = vec![
            format!("SupervisorAgent review: {checkpoint} checkpoint"),
            format!("reviewed confidence: {:.2}", reviewed.confidence),
        ];
        evidence.extend(issues.iter().map(|issue| format!("issue: {issue}")));

        if issues.is_empty() {
            AgentDecision {
                decision: "SupervisorAgent approved: flow continues as planned".to_string(),
                confidence: 0.8,
                evidence,
                next_step: reviewed.next_step.clone(),
            }
        } else {
            AgentDecision {
                decision: "SupervisorAgent intervened: escalating due to safety concerns"
                    .to_string(),
                confidence: 0.9,
                evidence,
                next_step: NEXT_STEP_ESCALATE.to_string(),
            }
        }
    }
}

impl Default for SupervisorAgent {
    fn default() -> Self {
        Self::new()
    }
}
