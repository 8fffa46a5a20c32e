use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::exceptions::{ExceptionRow, Severity};
use crate::embeddings::{EmbeddingProvider, SimilarityIndex};
use crate::packs::{DomainPack, TenantPolicyPack};

// key: agent-decisions -> structured-outputs

pub const NEXT_STEP_POLICY: &str = "ProceedToPolicy";
pub const NEXT_STEP_EXECUTE: &str = "ExecutePlaybook";
pub const NEXT_STEP_REQUIRE_APPROVAL: &str = "REQUIRE_APPROVAL";
pub const NEXT_STEP_ESCALATE: &str = "ESCALATE";
pub const NEXT_STEP_CLOSE: &str = "CLOSE";

/// Standardized agent output consumed by the workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDecision {
    pub decision: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(rename = "nextStep")]
    pub next_step: String,
}

/// Context threaded through the agent chain: prior outputs keyed by agent
/// name plus the packs in effect for the tenant.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub prior_outputs: HashMap<String, AgentDecision>,
    pub domain_pack: Option<DomainPack>,
    pub tenant_policy: Option<TenantPolicyPack>,
}

impl AgentContext {
    pub fn with_prior(mut self, agent_name: &str, decision: AgentDecision) -> Self {
        self.prior_outputs.insert(agent_name.to_string(), decision);
        self
    }
}

/// Single polymorphic capability over the agent set; implementations are
/// dispatched by worker wiring, never by runtime attribute checks.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, exception: &ExceptionRow, context: &AgentContext) -> AgentDecision;
}

/// Classifies exception type and severity from pack rules; consults the
/// similarity index for supporting evidence when one is wired.
pub struct TriageAgent {
    embeddings: Option<(Arc<dyn EmbeddingProvider>, Arc<SimilarityIndex>)>,
}

impl TriageAgent {
    pub fn new() -> Self {
        Self { embeddings: None }
    }

    pub fn with_similarity(
        provider: Arc<dyn EmbeddingProvider>,
        index: Arc<SimilarityIndex>,
    ) -> Self {
        Self {
            embeddings: Some((provider, index)),
        }
    }

    fn classify_severity(
        &self,
        exception: &ExceptionRow,
        context: &AgentContext,
    ) -> (Severity, f64, Vec<String>) {
        let mut evidence = Vec::new();

        if let Some(policy) = &context.tenant_policy {
            if let Some(overridden) = policy
                .custom_severity_overrides
                .iter()
                .find(|entry| entry.exception_type == exception.exception_type)
                .and_then(|entry| Severity::from_str_ci(&entry.severity))
            {
                evidence.push(format!(
                    "tenant severity override matched: {} -> {}",
                    exception.exception_type,
                    overridden.as_str()
                ));
                return (overridden, 0.9, evidence);
            }
        }

        if let Some(pack) = &context.domain_pack {
            if let Some(rule_severity) = pack
                .severity_rules
                .iter()
                .find(|rule| rule.exception_type == exception.exception_type)
                .and_then(|rule| Severity::from_str_ci(&rule.severity))
            {
                evidence.push(format!(
                    "domain severity rule matched: {} -> {}",
                    exception.exception_type,
                    rule_severity.as_str()
                ));
                return (rule_severity, 0.85, evidence);
            }
        }

        let fallback = exception.severity().unwrap_or(Severity::Medium);
        evidence.push(format!(
            "no severity rule matched, keeping reported severity {}",
            fallback.as_str()
        ));
        (fallback, 0.6, evidence)
    }
}

impl Default for TriageAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for TriageAgent {
    fn name(&self) -> &'static str {
        "TriageAgent"
    }

    async fn process(&self, exception: &ExceptionRow, context: &AgentContext) -> AgentDecision {
        let (severity, mut confidence, mut evidence) = self.classify_severity(exception, context);

        if let Some((provider, index)) = &self.embeddings {
            let query = format!("{}: {}", exception.exception_type, exception.raw_payload);
            let vector = provider.embed(&query);
            let neighbors = index.nearest(&vector, 3);
            if let Some((label, score)) = neighbors.first() {
                if *score > 0.7 {
                    evidence.push(format!("similar past exception: {label} (similarity {score:.2})"));
                    confidence = (confidence + 0.05).min(1.0);
                }
            }
            index.insert(
                &format!("{}: {}", exception.exception_id, exception.exception_type),
                vector,
            );
        }

        AgentDecision {
            decision: format!(
                "Classified as {} with severity {}",
                exception.exception_type,
                severity.as_str()
            ),
            confidence,
            evidence,
            next_step: NEXT_STEP_POLICY.to_string(),
        }
    }
}

/// Enforces tenant guardrails over the candidate action (playbook
/// execution). Violation recording happens in the policy worker, which also
/// sees the matching result.
pub struct PolicyAgent;

impl PolicyAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PolicyAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for PolicyAgent {
    fn name(&self) -> &'static str {
        "PolicyAgent"
    }

    async fn process(&self, exception: &ExceptionRow, context: &AgentContext) -> AgentDecision {
        let mut evidence = Vec::new();
        let triage_confidence = context
            .prior_outputs
            .get("TriageAgent")
            .map(|decision| decision.confidence)
            .unwrap_or(0.0);
        evidence.push(format!("triage confidence: {triage_confidence:.2}"));

        let severity = exception.severity().unwrap_or(Severity::Medium);
        let guardrails = context
            .tenant_policy
            .as_ref()
            .and_then(|policy| policy.effective_guardrails(context.domain_pack.as_ref()));

        let mut requires_approval = false;

        if let Some(policy) = &context.tenant_policy {
            if let Some(rule) = policy
                .human_approval_rules
                .iter()
                .find(|rule| rule.severity.eq_ignore_ascii_case(severity.as_str()))
            {
                if rule.require_approval {
                    requires_approval = true;
                    evidence.push(format!(
                        "human approval rule for severity {} requires approval",
                        severity.as_str()
                    ));
                }
            }
        }

        let confidence = (triage_confidence * 0.9).clamp(0.3, 0.95);
        if let Some(guardrails) = guardrails {
            evidence.push(format!(
                "human approval threshold: {:.2}",
                guardrails.human_approval_threshold
            ));
            if confidence < guardrails.human_approval_threshold {
                requires_approval = true;
                evidence.push(format!(
                    "confidence {:.2} below approval threshold",
                    confidence
                ));
            }
        }

        if severity == Severity::Critical {
            requires_approval = true;
            evidence.push("CRITICAL severity always requires human approval".to_string());
        }

        if requires_approval {
            AgentDecision {
                decision: "REQUIRE_APPROVAL".to_string(),
                confidence,
                evidence,
                next_step: NEXT_STEP_REQUIRE_APPROVAL.to_string(),
            }
        } else {
            AgentDecision {
                decision: "ALLOW".to_string(),
                confidence,
                evidence,
                next_step: NEXT_STEP_EXECUTE.to_string(),
            }
        }
    }
}

/// Produces the resolution summary once a playbook has run to completion.
pub struct ResolutionAgent;

impl ResolutionAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ResolutionAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for ResolutionAgent {
    fn name(&self) -> &'static str {
        "ResolutionAgent"
    }

    async fn process(&self, exception: &ExceptionRow, context: &AgentContext) -> AgentDecision {
        let mut evidence = Vec::new();
        let playbook = exception.current_playbook_id;
        if let Some(playbook_id) = playbook {
            evidence.push(format!("playbook_id: {playbook_id}"));
        }
        let policy_confidence = context
            .prior_outputs
            .get("PolicyAgent")
            .map(|decision| decision.confidence)
            .unwrap_or(0.7);
        evidence.push(format!("policy confidence: {policy_confidence:.2}"));

        AgentDecision {
            decision: match playbook {
                Some(playbook_id) => {
                    format!("Resolution plan executed via playbook {playbook_id}")
                }
                None => "Resolved without playbook".to_string(),
            },
            confidence: 0.9_f64.min(policy_confidence + 0.1),
            evidence,
            next_step: NEXT_STEP_CLOSE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn exception(exception_type: &str, severity: &str) -> ExceptionRow {
        ExceptionRow {
            exception_id: "EXC-1".into(),
            tenant_id: "t1".into(),
            source_system: "billing".into(),
            exception_type: exception_type.into(),
            severity: severity.into(),
            resolution_status: "OPEN".into(),
            raw_payload: json!({"account": 42}),
            normalized_context: json!({"domain": "billing"}),
            current_playbook_id: None,
            current_step: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn context_with_packs() -> AgentContext {
        AgentContext {
            domain_pack: Some(
                serde_json::from_value(json!({
                    "domain": "billing",
                    "version": "1",
                    "severityRules": [
                        {"exceptionType": "DataQualityFailure", "severity": "MEDIUM"},
                    ],
                }))
                .unwrap(),
            ),
            tenant_policy: Some(
                serde_json::from_value(json!({
                    "tenantId": "t1",
                    "domainName": "billing",
                    "customGuardrails": {
                        "allowLists": [],
                        "blockLists": [],
                        "humanApprovalThreshold": 0.6,
                    },
                }))
                .unwrap(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn triage_applies_domain_rule() {
        let agent = TriageAgent::new();
        let decision = agent
            .process(&exception("DataQualityFailure", "LOW"), &context_with_packs())
            .await;
        assert!(decision.decision.contains("MEDIUM"));
        assert!(decision.confidence >= 0.85);
        assert_eq!(decision.next_step, NEXT_STEP_POLICY);
    }

    #[tokio::test]
    async fn triage_nextstep_serializes_camel_case() {
        let agent = TriageAgent::new();
        let decision = agent
            .process(&exception("Unknown", "LOW"), &AgentContext::default())
            .await;
        let value = serde_json::to_value(&decision).unwrap();
        assert!(value.get("nextStep").is_some());
    }

    #[tokio::test]
    async fn policy_allows_confident_medium() {
        let agent = PolicyAgent::new();
        let triage = AgentDecision {
            decision: "Classified".into(),
            confidence: 0.85,
            evidence: vec![],
            next_step: NEXT_STEP_POLICY.into(),
        };
        let context = context_with_packs().with_prior("TriageAgent", triage);
        let decision = agent
            .process(&exception("DataQualityFailure", "MEDIUM"), &context)
            .await;
        assert_eq!(decision.decision, "ALLOW");
        assert_eq!(decision.next_step, NEXT_STEP_EXECUTE);
    }

    #[tokio::test]
    async fn policy_requires_approval_for_critical() {
        let agent = PolicyAgent::new();
        let triage = AgentDecision {
            decision: "Classified".into(),
            confidence: 0.95,
            evidence: vec![],
            next_step: NEXT_STEP_POLICY.into(),
        };
        let context = context_with_packs().with_prior("TriageAgent", triage);
        let decision = agent
            .process(&exception("OutageDetected", "CRITICAL"), &context)
            .await;
        assert_eq!(decision.next_step, NEXT_STEP_REQUIRE_APPROVAL);
    }
}
