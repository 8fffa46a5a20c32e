use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::agents::{AgentContext, AgentDecision, NEXT_STEP_ESCALATE};
use crate::db::exceptions::{self, ResolutionStatus};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::observability::AuditLogger;
use crate::supervisor::SupervisorAgent;
use crate::workers::{EventProcessor, WorkerError};

/// Runs the supervisor checkpoints after policy evaluation and after
/// resolution; interventions mark the exception ESCALATED and emit
/// `Escalated`.
pub struct SupervisorWorker {
    pool: PgPool,
    agent: SupervisorAgent,
    audit: Arc<AuditLogger>,
}

impl SupervisorWorker {
    pub fn new(pool: PgPool, agent: SupervisorAgent, audit: Arc<AuditLogger>) -> Self {
        Self { pool, agent, audit }
    }

    fn context_from_payload(payload: &Value) -> AgentContext {
        let mut context = AgentContext::default();
        if let Some(priors) = payload.get("prior_outputs").and_then(Value::as_object) {
            for (name, value) in priors {
                if let Ok(decision) = serde_json::from_value::<AgentDecision>(value.clone()) {
                    context.prior_outputs.insert(name.clone(), decision);
                }
            }
        }
        context
    }
}

#[async_trait]
impl EventProcessor for SupervisorWorker {
    fn worker_name(&self) -> &'static str {
        "SupervisorWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            event_types::POLICY_EVALUATION_COMPLETED | event_types::RESOLVED
        )
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("supervised event without exception_id".into()))?;

        let exception = exceptions::get(&self.pool, &event.tenant_id, &exception_id)
            .await?
            .ok_or_else(|| {
                WorkerError::Failed(format!(
                    "exception {exception_id} not found for tenant {}",
                    event.tenant_id
                ))
            })?;

        let (stage, decision_key) = if event.event_type == event_types::RESOLVED {
            ("post-resolution", "resolution")
        } else {
            ("post-policy", "decision")
        };
        let Some(reviewed) = event
            .payload
            .get(decision_key)
            .and_then(|value| serde_json::from_value::<AgentDecision>(value.clone()).ok())
        else {
            tracing::warn!(
                event_type = %event.event_type,
                %exception_id,
                "supervised event carries no reviewable decision"
            );
            return Ok(Vec::new());
        };

        let context = Self::context_from_payload(&event.payload);
        let review = if stage == "post-resolution" {
            self.agent
                .review_post_resolution(&exception, &reviewed, &context)
        } else {
            self.agent.review_post_policy(&exception, &reviewed, &context)
        };
        self.audit
            .log_agent_decision(&event.tenant_id, "SupervisorAgent", &exception_id, &review);

        if review.next_step != NEXT_STEP_ESCALATE {
            return Ok(Vec::new());
        }

        exceptions::set_status(
            &self.pool,
            &event.tenant_id,
            &exception_id,
            ResolutionStatus::Escalated,
        )
        .await?;

        Ok(vec![CanonicalEvent::new(
            event_types::ESCALATED,
            &event.tenant_id,
            &exception_id,
            ActorType::Agent,
            "SupervisorAgent",
            json!({
                "reviewed_stage": stage,
                "review": review,
            }),
        )])
    }
}
