use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::exceptions::{ExceptionRow, Severity};
use crate::agents::AgentDecision;
use crate::packs::{DomainPack, TenantPolicyPack};

// key: safety -> guardrail-violations

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Policy,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub rule_id: Option<String>,
    pub description: String,
    pub context: Value,
    pub created_at: DateTime<Utc>,
}

impl Violation {
    pub fn policy(
        tenant_id: &str,
        rule_id: &str,
        severity: Severity,
        description: String,
        context: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            kind: ViolationKind::Policy,
            severity,
            rule_id: Some(rule_id.to_string()),
            description,
            context,
            created_at: Utc::now(),
        }
    }

    pub fn tool(
        tenant_id: &str,
        rule_id: &str,
        severity: Severity,
        description: String,
        context: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            kind: ViolationKind::Tool,
            severity,
            rule_id: Some(rule_id.to_string()),
            description,
            context,
            created_at: Utc::now(),
        }
    }
}

/// Append-only JSONL persistence keyed by tenant. One file per tenant under
/// the configured directory; writes are serialized by a mutex.
pub struct ViolationStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
    recent: DashMap<String, Vec<Violation>>,
}

impl ViolationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
            recent: DashMap::new(),
        }
    }

    pub fn record(&self, violation: &Violation) {
        let _guard = self.write_lock.lock().expect("violation store mutex");
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            tracing::error!(?err, "failed to create violation directory");
            return;
        }
        let path = self.dir.join(format!("{}.jsonl", violation.tenant_id));
        let line = match serde_json::to_string(violation) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(?err, "failed to serialize violation");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            tracing::error!(?err, path = %path.display(), "failed to append violation");
        }
        self.recent
            .entry(violation.tenant_id.clone())
            .or_default()
            .push(violation.clone());
        tracing::warn!(
            tenant_id = %violation.tenant_id,
            kind = ?violation.kind,
            severity = violation.severity.as_str(),
            rule_id = violation.rule_id.as_deref().unwrap_or("-"),
            "violation recorded"
        );
    }

    /// Violations recorded by this process, newest last.
    pub fn recent_for_tenant(&self, tenant_id: &str) -> Vec<Violation> {
        self.recent
            .get(tenant_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Detects guardrail breaches in agent decisions and records them. High and
/// critical findings are what the notification path keys on.
pub struct ViolationDetector {
    store: std::sync::Arc<ViolationStore>,
}

impl ViolationDetector {
    pub fn new(store: std::sync::Arc<ViolationStore>) -> Self {
        Self { store }
    }

    pub fn check_policy_decision(
        &self,
        exception: &ExceptionRow,
        policy_decision: &AgentDecision,
        tenant_policy: &TenantPolicyPack,
        domain_pack: Option<&DomainPack>,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();
        let tenant_id = &exception.tenant_id;
        let requires_approval = policy_decision.next_step.contains("REQUIRE_APPROVAL");
        let allowed = policy_decision.decision.to_uppercase().contains("ALLOW");

        if let Some(guardrails) = tenant_policy.effective_guardrails(domain_pack) {
            let decision_upper = policy_decision.decision.to_uppercase();
            for blocked in &guardrails.block_lists {
                if decision_upper.contains(&blocked.to_uppercase()) {
                    violations.push(Violation::policy(
                        tenant_id,
                        &format!("block_list_{blocked}"),
                        Severity::High,
                        format!("policy decision violates block list: {blocked}"),
                        json!({
                            "exception_id": exception.exception_id,
                            "decision": policy_decision.decision,
                            "blocked_item": blocked,
                        }),
                    ));
                }
            }

            if allowed
                && !requires_approval
                && policy_decision.confidence < guardrails.human_approval_threshold
            {
                violations.push(Violation::policy(
                    tenant_id,
                    "human_approval_threshold",
                    Severity::Medium,
                    format!(
                        "ALLOW with confidence {:.2} below approval threshold {:.2} without requiring approval",
                        policy_decision.confidence, guardrails.human_approval_threshold
                    ),
                    json!({
                        "exception_id": exception.exception_id,
                        "confidence": policy_decision.confidence,
                        "threshold": guardrails.human_approval_threshold,
                    }),
                ));
            }
        }

        if let Some(severity) = exception.severity() {
            for rule in &tenant_policy.human_approval_rules {
                if rule.require_approval
                    && rule.severity.eq_ignore_ascii_case(severity.as_str())
                    && allowed
                    && !requires_approval
                {
                    violations.push(Violation::policy(
                        tenant_id,
                        &format!("human_approval_rule_{}", rule.severity),
                        Severity::High,
                        format!(
                            "severity {} requires approval but decision is ALLOW without approval",
                            severity.as_str()
                        ),
                        json!({
                            "exception_id": exception.exception_id,
                            "severity": severity.as_str(),
                        }),
                    ));
                }
            }

            if severity == Severity::Critical && allowed && !requires_approval {
                violations.push(Violation::policy(
                    tenant_id,
                    "critical_severity_auto_action",
                    Severity::Critical,
                    "CRITICAL severity exception allowed without approval".to_string(),
                    json!({
                        "exception_id": exception.exception_id,
                        "decision": policy_decision.decision,
                        "severity": "CRITICAL",
                    }),
                ));
            }
        }

        for violation in &violations {
            self.store.record(violation);
        }
        violations
    }

    /// Tool-side violation, raised by the execution engine on repeated
    /// authentication failures.
    pub fn record_tool_auth_failure(
        &self,
        tenant_id: &str,
        tool_id: i64,
        tool_name: &str,
        failures: u32,
    ) {
        let violation = Violation::tool(
            tenant_id,
            "tool_auth_failure",
            Severity::High,
            format!("repeated authentication failures for tool '{tool_name}'"),
            json!({"tool_id": tool_id, "tool_name": tool_name, "consecutive_failures": failures}),
        );
        self.store.record(&violation);
    }
}

/// In-process incident register. CRITICAL violations are promoted here so an
/// operator can acknowledge and close them.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: Uuid,
    pub tenant_id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub violation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Closed,
}

#[derive(Default)]
pub struct IncidentManager {
    incidents: DashMap<Uuid, Incident>,
}

impl IncidentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_from_violation(&self, violation: &Violation) -> Uuid {
        let incident = Incident {
            id: Uuid::new_v4(),
            tenant_id: violation.tenant_id.clone(),
            title: violation.description.clone(),
            status: IncidentStatus::Open,
            violation_id: Some(violation.id),
            created_at: Utc::now(),
            acknowledged_by: None,
            closed_at: None,
        };
        let id = incident.id;
        tracing::error!(tenant_id = %incident.tenant_id, incident_id = %id, "incident opened");
        self.incidents.insert(id, incident);
        id
    }

    pub fn acknowledge(&self, id: Uuid, user: &str) -> bool {
        match self.incidents.get_mut(&id) {
            Some(mut incident) if incident.status == IncidentStatus::Open => {
                incident.status = IncidentStatus::Acknowledged;
                incident.acknowledged_by = Some(user.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn close(&self, id: Uuid) -> bool {
        match self.incidents.get_mut(&id) {
            Some(mut incident) if incident.status != IncidentStatus::Closed => {
                incident.status = IncidentStatus::Closed;
                incident.closed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn open_incidents(&self, tenant_id: &str) -> Vec<Incident> {
        self.incidents
            .iter()
            .filter(|entry| {
                entry.value().tenant_id == tenant_id && entry.value().status != IncidentStatus::Closed
            })
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDecision;
    use std::sync::Arc;

    fn exception(severity: &str) -> ExceptionRow {
        ExceptionRow {
            exception_id: "EXC-1".into(),
            tenant_id: "t1".into(),
            source_system: "billing".into(),
            exception_type: "DataQualityFailure".into(),
            severity: severity.into(),
            resolution_status: "IN_PROGRESS".into(),
            raw_payload: json!({}),
            normalized_context: json!({}),
            current_playbook_id: None,
            current_step: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tenant_policy(threshold: f64) -> TenantPolicyPack {
        serde_json::from_value(json!({
            "tenantId": "t1",
            "domainName": "billing",
            "customGuardrails": {
                "allowLists": [],
                "blockLists": ["DELETE_ACCOUNT"],
                "humanApprovalThreshold": threshold,
            },
            "humanApprovalRules": [{"severity": "HIGH", "requireApproval": true}],
        }))
        .unwrap()
    }

    fn detector(dir: &std::path::Path) -> ViolationDetector {
        ViolationDetector::new(Arc::new(ViolationStore::new(dir)))
    }

    #[test]
    fn critical_allow_without_approval_is_critical_violation() {
        let tmp = tempfile::tempdir().unwrap();
        let detector = detector(tmp.path());
        let decision = AgentDecision {
            decision: "ALLOW".into(),
            confidence: 0.9,
            evidence: vec![],
            next_step: "ExecutePlaybook".into(),
        };
        let violations = detector.check_policy_decision(
            &exception("CRITICAL"),
            &decision,
            &tenant_policy(0.8),
            None,
        );
        assert!(violations
            .iter()
            .any(|violation| violation.rule_id.as_deref() == Some("critical_severity_auto_action")
                && violation.severity == Severity::Critical));
    }

    #[test]
    fn block_list_hit_is_high_violation() {
        let tmp = tempfile::tempdir().unwrap();
        let detector = detector(tmp.path());
        let decision = AgentDecision {
            decision: "ALLOW: DELETE_ACCOUNT for user".into(),
            confidence: 0.95,
            evidence: vec![],
            next_step: "ExecutePlaybook".into(),
        };
        let violations = detector.check_policy_decision(
            &exception("MEDIUM"),
            &decision,
            &tenant_policy(0.8),
            None,
        );
        assert!(violations
            .iter()
            .any(|violation| violation.rule_id.as_deref() == Some("block_list_DELETE_ACCOUNT")));
    }

    #[test]
    fn approval_requirement_suppresses_threshold_violation() {
        let tmp = tempfile::tempdir().unwrap();
        let detector = detector(tmp.path());
        let decision = AgentDecision {
            decision: "ALLOW".into(),
            confidence: 0.5,
            evidence: vec![],
            next_step: "REQUIRE_APPROVAL".into(),
        };
        let violations = detector.check_policy_decision(
            &exception("MEDIUM"),
            &decision,
            &tenant_policy(0.8),
            None,
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn violations_are_journaled_per_tenant() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ViolationStore::new(tmp.path());
        let violation = Violation::tool("t1", "tool_auth_failure", Severity::High, "x".into(), json!({}));
        store.record(&violation);
        let contents = std::fs::read_to_string(tmp.path().join("t1.jsonl")).unwrap();
        assert!(contents.contains("tool_auth_failure"));
        assert_eq!(store.recent_for_tenant("t1").len(), 1);
        assert!(store.recent_for_tenant("t2").is_empty());
    }

    #[test]
    fn incident_lifecycle() {
        let manager = IncidentManager::new();
        let violation =
            Violation::policy("t1", "critical_severity_auto_action", Severity::Critical, "x".into(), json!({}));
        let id = manager.open_from_violation(&violation);
        assert_eq!(manager.open_incidents("t1").len(), 1);
        assert!(manager.acknowledge(id, "ops"));
        assert!(!manager.acknowledge(id, "ops"));
        assert!(manager.close(id));
        assert!(manager.open_incidents("t1").is_empty());
    }
}
