use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::db::{exceptions, playbooks};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::observability::TenantMetrics;
use crate::playbooks::{is_risky_action, PlaybookExecutionError, PlaybookExecutionService};
use crate::workers::{EventProcessor, WorkerError};

/// Starts matched playbooks and auto-advances consecutive safe steps with an
/// agent actor. Risky steps park the exception until a human completes them
/// through the API; their age feeds the approval-queue alert.
pub struct PlaybookExecutorWorker {
    pool: PgPool,
    service: Arc<PlaybookExecutionService>,
    metrics: Arc<TenantMetrics>,
}

impl PlaybookExecutorWorker {
    pub fn new(
        pool: PgPool,
        service: Arc<PlaybookExecutionService>,
        metrics: Arc<TenantMetrics>,
    ) -> Self {
        Self {
            pool,
            service,
            metrics,
        }
    }

    /// Complete safe steps until a risky one (or the end) is reached. The
    /// service's events are emitted through its own sink; the runner only
    /// dedups the triggering event.
    async fn advance_safe_steps(
        &self,
        tenant_id: &str,
        exception_id: &str,
    ) -> Result<(), WorkerError> {
        loop {
            let Some(exception) = exceptions::get(&self.pool, tenant_id, exception_id).await? else {
                return Ok(());
            };
            let (Some(playbook_id), Some(current_step)) =
                (exception.current_playbook_id, exception.current_step)
            else {
                self.metrics.approval_settled(tenant_id, exception_id);
                return Ok(());
            };

            let steps = playbooks::steps(&self.pool, playbook_id).await?;
            let Some(step) = steps.iter().find(|step| step.step_order == current_step) else {
                return Ok(());
            };

            if is_risky_action(&step.action_type) {
                tracing::info!(
                    %tenant_id,
                    %exception_id,
                    step_order = current_step,
                    action_type = %step.action_type,
                    "risky step awaiting human approval"
                );
                self.metrics.approval_pending(tenant_id, exception_id);
                return Ok(());
            }

            match self
                .service
                .complete_step(
                    tenant_id,
                    exception_id,
                    playbook_id,
                    current_step,
                    ActorType::Agent,
                    "playbook-executor",
                    None,
                )
                .await
            {
                Ok(()) => continue,
                // Another consumer advanced the step first; the pipeline is
                // already further along than this delivery believed.
                Err(PlaybookExecutionError::WrongStep { .. })
                | Err(PlaybookExecutionError::PlaybookNotActive { .. })
                | Err(PlaybookExecutionError::NoCurrentStep(_)) => return Ok(()),
                Err(PlaybookExecutionError::Database(err)) => return Err(err.into()),
                Err(err) => return Err(WorkerError::Failed(err.to_string())),
            }
        }
    }
}

#[async_trait]
impl EventProcessor for PlaybookExecutorWorker {
    fn worker_name(&self) -> &'static str {
        "PlaybookExecutorWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            event_types::PLAYBOOK_MATCHED
                | event_types::PLAYBOOK_STEP_COMPLETED
                | event_types::PLAYBOOK_STEP_SKIPPED
        )
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("playbook event without exception_id".into()))?;

        if event.event_type == event_types::PLAYBOOK_MATCHED {
            let playbook_id = event
                .payload
                .get("playbook_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    WorkerError::Malformed("PlaybookMatched without playbook_id".into())
                })?;
            match self
                .service
                .start(
                    &event.tenant_id,
                    &exception_id,
                    playbook_id,
                    ActorType::Agent,
                    "playbook-executor",
                )
                .await
            {
                Ok(()) => {}
                Err(PlaybookExecutionError::Database(err)) => return Err(err.into()),
                Err(err) => return Err(WorkerError::Failed(err.to_string())),
            }
        } else {
            // A step completed (possibly by a human): the pending-approval
            // clock for this exception stops until the next risky step.
            self.metrics.approval_settled(&event.tenant_id, &exception_id);
        }

        self.advance_safe_steps(&event.tenant_id, &exception_id).await?;
        Ok(Vec::new())
    }
}
