use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use crate::agents::{Agent, AgentContext, AgentDecision, ResolutionAgent};
use crate::db::{exception_events, exceptions};
use crate::db::exceptions::ResolutionStatus;
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::observability::AuditLogger;
use crate::packs::PackRegistry;
use crate::workers::{EventProcessor, WorkerError};

/// Closes out exceptions whose playbook ran to completion.
pub struct ResolutionWorker {
    pool: PgPool,
    packs: Arc<PackRegistry>,
    agent: ResolutionAgent,
    audit: Arc<AuditLogger>,
}

impl ResolutionWorker {
    pub fn new(
        pool: PgPool,
        packs: Arc<PackRegistry>,
        agent: ResolutionAgent,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            pool,
            packs,
            agent,
            audit,
        }
    }

    /// The policy decision for this exception, reconstructed from the event
    /// timeline (decisions are not persisted as rows of their own).
    async fn latest_policy_decision(
        &self,
        tenant_id: &str,
        exception_id: &str,
    ) -> Result<Option<AgentDecision>, sqlx::Error> {
        let events = exception_events::list_for_exception(&self.pool, tenant_id, exception_id).await?;
        Ok(events
            .iter()
            .rev()
            .find(|event| event.event_type == event_types::POLICY_EVALUATION_COMPLETED)
            .and_then(|event| {
                event
                    .payload
                    .get("decision")
                    .and_then(|value| serde_json::from_value(value.clone()).ok())
            }))
    }
}

#[async_trait]
impl EventProcessor for ResolutionWorker {
    fn worker_name(&self) -> &'static str {
        "ResolutionWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == event_types::PLAYBOOK_COMPLETED
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("PlaybookCompleted without exception_id".into()))?;

        let exception = exceptions::get(&self.pool, &event.tenant_id, &exception_id)
            .await?
            .ok_or_else(|| {
                WorkerError::Failed(format!(
                    "exception {exception_id} not found for tenant {}",
                    event.tenant_id
                ))
            })?;

        let mut context = AgentContext {
            prior_outputs: Default::default(),
            domain_pack: self.packs.domain_pack_for_tenant(&event.tenant_id),
            tenant_policy: self.packs.tenant_policy(&event.tenant_id),
        };
        if let Some(policy_decision) = self
            .latest_policy_decision(&event.tenant_id, &exception_id)
            .await?
        {
            context = context.with_prior("PolicyAgent", policy_decision);
        }

        let decision = self.agent.process(&exception, &context).await;
        self.audit
            .log_agent_decision(&event.tenant_id, self.agent.name(), &exception_id, &decision);

        exceptions::set_status(
            &self.pool,
            &event.tenant_id,
            &exception_id,
            ResolutionStatus::Resolved,
        )
        .await?;
        exceptions::set_current_step(&self.pool, &event.tenant_id, &exception_id, None).await?;

        let mut prior_outputs = json!({});
        for (name, prior) in &context.prior_outputs {
            prior_outputs[name.as_str()] = json!(prior);
        }

        Ok(vec![CanonicalEvent::new(
            event_types::RESOLVED,
            &event.tenant_id,
            &exception_id,
            ActorType::Agent,
            self.agent.name(),
            json!({
                "resolution": decision,
                "prior_outputs": prior_outputs,
                "playbook_id": exception.current_playbook_id,
            }),
        )])
    }
}
