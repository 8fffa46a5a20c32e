use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use crate::agents::{Agent, AgentContext, TriageAgent};
use crate::db::exceptions::{self, Severity};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::observability::AuditLogger;
use crate::packs::PackRegistry;
use crate::workers::{EventProcessor, WorkerError};

/// Runs the triage agent and persists the (possibly re-)classified severity.
pub struct TriageWorker {
    pool: PgPool,
    packs: Arc<PackRegistry>,
    agent: TriageAgent,
    audit: Arc<AuditLogger>,
}

impl TriageWorker {
    pub fn new(
        pool: PgPool,
        packs: Arc<PackRegistry>,
        agent: TriageAgent,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            pool,
            packs,
            agent,
            audit,
        }
    }
}

#[async_trait]
impl EventProcessor for TriageWorker {
    fn worker_name(&self) -> &'static str {
        "TriageWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == event_types::TRIAGE_REQUESTED
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("TriageRequested without exception_id".into()))?;

        let exception = exceptions::get(&self.pool, &event.tenant_id, &exception_id)
            .await?
            .ok_or_else(|| {
                WorkerError::Failed(format!(
                    "exception {exception_id} not found for tenant {}",
                    event.tenant_id
                ))
            })?;

        let context = AgentContext {
            prior_outputs: Default::default(),
            domain_pack: self.packs.domain_pack_for_tenant(&event.tenant_id),
            tenant_policy: self.packs.tenant_policy(&event.tenant_id),
        };
        let decision = self.agent.process(&exception, &context).await;
        self.audit
            .log_agent_decision(&event.tenant_id, self.agent.name(), &exception_id, &decision);

        let severity = decision
            .decision
            .rsplit(' ')
            .next()
            .and_then(Severity::from_str_ci)
            .or_else(|| exception.severity())
            .unwrap_or(Severity::Medium);
        exceptions::update_triage(&self.pool, &event.tenant_id, &exception_id, severity).await?;

        Ok(vec![CanonicalEvent::new(
            event_types::TRIAGE_COMPLETED,
            &event.tenant_id,
            &exception_id,
            ActorType::Agent,
            self.agent.name(),
            json!({
                "triage": decision,
                "severity": severity.as_str(),
            }),
        )])
    }
}
