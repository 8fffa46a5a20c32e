use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;

use crate::agents::{Agent, AgentContext, AgentDecision, PolicyAgent, NEXT_STEP_ESCALATE};
use crate::db::exceptions::Severity;
use crate::db::{exceptions, playbooks};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::matching;
use crate::notify::NotificationService;
use crate::observability::AuditLogger;
use crate::packs::PackRegistry;
use crate::safety::{IncidentManager, Violation, ViolationDetector};
use crate::workers::{EventProcessor, WorkerError};

/// Evaluates tenant guardrails over the triage outcome and matches a
/// playbook. Guardrail breaches are recorded as violations before the
/// supervisor ever sees the decision; high and critical breaches notify, and
/// critical ones open an incident.
pub struct PolicyWorker {
    pool: PgPool,
    packs: Arc<PackRegistry>,
    agent: PolicyAgent,
    detector: Arc<ViolationDetector>,
    audit: Arc<AuditLogger>,
    incidents: Arc<IncidentManager>,
    notifier: Arc<NotificationService>,
}

impl PolicyWorker {
    pub fn new(
        pool: PgPool,
        packs: Arc<PackRegistry>,
        agent: PolicyAgent,
        detector: Arc<ViolationDetector>,
        audit: Arc<AuditLogger>,
        incidents: Arc<IncidentManager>,
        notifier: Arc<NotificationService>,
    ) -> Self {
        Self {
            pool,
            packs,
            agent,
            detector,
            audit,
            incidents,
            notifier,
        }
    }

    async fn handle_violations(&self, tenant_id: &str, violations: &[Violation]) {
        for violation in violations {
            if violation.severity == Severity::Critical {
                self.incidents.open_from_violation(violation);
            }
            if !matches!(violation.severity, Severity::High | Severity::Critical) {
                continue;
            }
            let Some(policy) = self
                .packs
                .tenant_policy(tenant_id)
                .and_then(|policy| policy.notification_policies)
            else {
                continue;
            };
            let subject = format!(
                "Policy violation: {} - {}",
                violation.severity.as_str(),
                violation.rule_id.as_deref().unwrap_or("unknown_rule")
            );
            let result = self
                .notifier
                .send(tenant_id, "Ops", &subject, &violation.description, None, &policy)
                .await;
            if !result.success {
                tracing::warn!(%tenant_id, subject = %subject, "violation notification failed on all channels");
            }
        }
    }
}

#[async_trait]
impl EventProcessor for PolicyWorker {
    fn worker_name(&self) -> &'static str {
        "PolicyWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == event_types::TRIAGE_COMPLETED
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("TriageCompleted without exception_id".into()))?;

        let exception = exceptions::get(&self.pool, &event.tenant_id, &exception_id)
            .await?
            .ok_or_else(|| {
                WorkerError::Failed(format!(
                    "exception {exception_id} not found for tenant {}",
                    event.tenant_id
                ))
            })?;

        let triage_decision: Option<AgentDecision> = event
            .payload
            .get("triage")
            .and_then(|value| serde_json::from_value(value.clone()).ok());

        let mut events = vec![CanonicalEvent::new(
            event_types::POLICY_EVALUATION_REQUESTED,
            &event.tenant_id,
            &exception_id,
            ActorType::System,
            "policy-worker",
            json!({}),
        )];

        let mut context = AgentContext {
            prior_outputs: Default::default(),
            domain_pack: self.packs.domain_pack_for_tenant(&event.tenant_id),
            tenant_policy: self.packs.tenant_policy(&event.tenant_id),
        };
        if let Some(triage) = triage_decision.clone() {
            context = context.with_prior("TriageAgent", triage);
        }

        let decision = self.agent.process(&exception, &context).await;
        self.audit
            .log_agent_decision(&event.tenant_id, self.agent.name(), &exception_id, &decision);

        let violations = match &context.tenant_policy {
            Some(tenant_policy) => self.detector.check_policy_decision(
                &exception,
                &decision,
                tenant_policy,
                context.domain_pack.as_ref(),
            ),
            None => Vec::new(),
        };
        self.handle_violations(&event.tenant_id, &violations).await;

        // Matching is pure; the playbook executor reacts to PlaybookMatched.
        let candidates = playbooks::list_for_tenant(&self.pool, &event.tenant_id).await?;
        let match_result = matching::match_playbook(
            &exception,
            &candidates,
            context.tenant_policy.as_ref(),
            Utc::now(),
        );

        let mut prior_outputs = json!({});
        if let Some(triage) = &triage_decision {
            prior_outputs["TriageAgent"] = json!(triage);
        }
        events.push(CanonicalEvent::new(
            event_types::POLICY_EVALUATION_COMPLETED,
            &event.tenant_id,
            &exception_id,
            ActorType::Agent,
            self.agent.name(),
            json!({
                "decision": decision,
                "prior_outputs": prior_outputs,
                "violations": violations.len(),
                "matched_playbook_id": match_result.playbook.as_ref().map(|p| p.playbook_id),
            }),
        ));

        if decision.next_step != NEXT_STEP_ESCALATE {
            if let Some(playbook) = match_result.playbook {
                events.push(CanonicalEvent::new(
                    event_types::PLAYBOOK_MATCHED,
                    &event.tenant_id,
                    &exception_id,
                    ActorType::Agent,
                    self.agent.name(),
                    json!({
                        "playbook_id": playbook.playbook_id,
                        "playbook_name": playbook.name,
                        "match_reason": match_result.reasoning,
                    }),
                ));
            } else {
                tracing::info!(
                    tenant_id = %event.tenant_id,
                    %exception_id,
                    reason = %match_result.reasoning,
                    "no playbook matched"
                );
            }
        }

        Ok(events)
    }
}
