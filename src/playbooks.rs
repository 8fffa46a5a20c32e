use std::sync::Arc;

use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;

use crate::db::exceptions;
use crate::db::playbooks::{self as playbook_repo, PlaybookStepRow};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::publisher::{EventSink, PublishError};
use crate::tools::engine::{ToolExecutionEngine, ToolExecutionError};

// key: playbook-execution -> sequential-human-gated

/// Step actions that may be completed without a human in the loop.
pub const SAFE_ACTION_TYPES: [&str; 4] = ["notify", "add_comment", "set_status", "assign_owner"];

pub fn is_risky_action(action_type: &str) -> bool {
    !SAFE_ACTION_TYPES.contains(&action_type)
}

#[derive(Debug, Error)]
pub enum PlaybookExecutionError {
    #[error("exception {exception_id} not found for tenant {tenant_id}")]
    ExceptionNotFound {
        tenant_id: String,
        exception_id: String,
    },
    #[error("playbook {playbook_id} not found or does not belong to tenant {tenant_id}")]
    PlaybookNotFound { tenant_id: String, playbook_id: i64 },
    #[error("playbook {0} has no steps")]
    NoSteps(i64),
    #[error("playbook {playbook_id} is not active for exception {exception_id} (current: {current:?})")]
    PlaybookNotActive {
        playbook_id: i64,
        exception_id: String,
        current: Option<i64>,
    },
    #[error("step {step_order} not found in playbook {playbook_id}")]
    StepNotFound { playbook_id: i64, step_order: i32 },
    #[error("exception {0} has no current step set")]
    NoCurrentStep(String),
    #[error("step {step_order} is not the next expected step (expected {expected})")]
    WrongStep { step_order: i32, expected: i32 },
    #[error(
        "step {step_order} requires human approval (risky action: {action_type}); \
         only USER actors can complete risky steps, got {actor_type}"
    )]
    HumanApprovalRequired {
        step_order: i32,
        action_type: String,
        actor_type: String,
    },
    #[error("call_tool step is invalid: {0}")]
    InvalidToolStep(String),
    #[error("tool execution failed: {0}")]
    ToolFailed(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event emission failed: {0}")]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone)]
struct StepToolOutcome {
    execution_id: String,
    tool_id: i64,
    status: String,
    success: bool,
    error_message: Option<String>,
}

/// Tenant-scoped, idempotent playbook advancement. Steps are strictly
/// sequential per exception; the broker partition key plus the single-step
/// advance below keep them that way.
pub struct PlaybookExecutionService {
    pool: PgPool,
    events: Arc<dyn EventSink>,
    tool_engine: Option<Arc<ToolExecutionEngine>>,
}

impl PlaybookExecutionService {
    pub fn new(
        pool: PgPool,
        events: Arc<dyn EventSink>,
        tool_engine: Option<Arc<ToolExecutionEngine>>,
    ) -> Self {
        Self {
            pool,
            events,
            tool_engine,
        }
    }

    pub async fn start(
        &self,
        tenant_id: &str,
        exception_id: &str,
        playbook_id: i64,
        actor_type: ActorType,
        actor_id: &str,
    ) -> Result<(), PlaybookExecutionError> {
        let exception = exceptions::get(&self.pool, tenant_id, exception_id)
            .await?
            .ok_or_else(|| PlaybookExecutionError::ExceptionNotFound {
                tenant_id: tenant_id.to_string(),
                exception_id: exception_id.to_string(),
            })?;

        let playbook = playbook_repo::get(&self.pool, tenant_id, playbook_id)
            .await?
            .ok_or(PlaybookExecutionError::PlaybookNotFound {
                tenant_id: tenant_id.to_string(),
                playbook_id,
            })?;

        let steps = playbook_repo::steps(&self.pool, playbook_id).await?;
        if steps.is_empty() {
            return Err(PlaybookExecutionError::NoSteps(playbook_id));
        }

        if exception.current_playbook_id == Some(playbook_id) {
            let already_started = crate::db::exception_events::exists_with_payload_keys(
                &self.pool,
                tenant_id,
                exception_id,
                event_types::PLAYBOOK_STARTED,
                &[("playbook_id", json!(playbook_id))],
            )
            .await?;
            if already_started {
                tracing::info!(%tenant_id, %exception_id, playbook_id, "playbook already started, skipping");
                return Ok(());
            }
        }

        exceptions::set_playbook(&self.pool, tenant_id, exception_id, playbook_id, 1).await?;

        let event = CanonicalEvent::new(
            event_types::PLAYBOOK_STARTED,
            tenant_id,
            exception_id,
            actor_type,
            actor_id,
            json!({
                "playbook_id": playbook_id,
                "playbook_name": playbook.name,
                "playbook_version": playbook.version,
                "total_steps": steps.len(),
            }),
        );
        self.events.emit(&event).await?;
        tracing::info!(%tenant_id, %exception_id, playbook_id, "playbook started");
        Ok(())
    }

    pub async fn complete_step(
        &self,
        tenant_id: &str,
        exception_id: &str,
        playbook_id: i64,
        step_order: i32,
        actor_type: ActorType,
        actor_id: &str,
        notes: Option<&str>,
    ) -> Result<(), PlaybookExecutionError> {
        let (step, total_steps) = self
            .check_preconditions(tenant_id, exception_id, playbook_id, step_order)
            .await?;

        // Human-approval gate: risky actions demand a USER actor.
        if is_risky_action(&step.action_type) && actor_type != ActorType::User {
            return Err(PlaybookExecutionError::HumanApprovalRequired {
                step_order,
                action_type: step.action_type.clone(),
                actor_type: actor_type.as_str().to_string(),
            });
        }

        if self
            .step_event_exists(
                tenant_id,
                exception_id,
                event_types::PLAYBOOK_STEP_COMPLETED,
                playbook_id,
                step_order,
            )
            .await?
        {
            tracing::info!(%exception_id, step_order, "step already completed, skipping");
            return Ok(());
        }

        let tool_outcome = if step.action_type == "call_tool" {
            Some(
                self.execute_tool_step(tenant_id, exception_id, &step, actor_type, actor_id)
                    .await?,
            )
        } else {
            None
        };

        let is_last_step = step_order as usize == total_steps;
        let next_step = if is_last_step { None } else { Some(step_order + 1) };
        exceptions::set_current_step(&self.pool, tenant_id, exception_id, next_step).await?;

        let mut payload = json!({
            "playbook_id": playbook_id,
            "step_id": step.step_id,
            "step_order": step_order,
            "step_name": step.name,
            "action_type": step.action_type,
            "is_last_step": is_last_step,
            "is_risky": is_risky_action(&step.action_type),
            "notes": notes,
        });
        if let Some(outcome) = &tool_outcome {
            payload["tool_execution"] = json!({
                "execution_id": outcome.execution_id,
                "tool_id": outcome.tool_id,
                "status": outcome.status,
                "success": outcome.success,
                "error_message": outcome.error_message,
            });
        }

        let event = CanonicalEvent::new(
            event_types::PLAYBOOK_STEP_COMPLETED,
            tenant_id,
            exception_id,
            actor_type,
            actor_id,
            payload,
        );
        self.events.emit(&event).await?;

        if is_last_step {
            let completed = CanonicalEvent::new(
                event_types::PLAYBOOK_COMPLETED,
                tenant_id,
                exception_id,
                actor_type,
                actor_id,
                json!({
                    "playbook_id": playbook_id,
                    "total_steps": total_steps,
                    "notes": notes,
                }),
            );
            self.events.emit(&completed).await?;
            tracing::info!(%tenant_id, %exception_id, playbook_id, "playbook completed");
        } else {
            tracing::info!(%tenant_id, %exception_id, step_order, total_steps, "step completed");
        }
        Ok(())
    }

    /// A skip is a decision, not an action: no human gating, always advances.
    pub async fn skip_step(
        &self,
        tenant_id: &str,
        exception_id: &str,
        playbook_id: i64,
        step_order: i32,
        actor_type: ActorType,
        actor_id: &str,
        notes: Option<&str>,
    ) -> Result<(), PlaybookExecutionError> {
        let (step, total_steps) = self
            .check_preconditions(tenant_id, exception_id, playbook_id, step_order)
            .await?;

        if self
            .step_event_exists(
                tenant_id,
                exception_id,
                event_types::PLAYBOOK_STEP_SKIPPED,
                playbook_id,
                step_order,
            )
            .await?
        {
            tracing::info!(%exception_id, step_order, "step already skipped, skipping");
            return Ok(());
        }

        let is_last_step = step_order as usize == total_steps;
        let next_step = if is_last_step { None } else { Some(step_order + 1) };
        exceptions::set_current_step(&self.pool, tenant_id, exception_id, next_step).await?;

        let event = CanonicalEvent::new(
            event_types::PLAYBOOK_STEP_SKIPPED,
            tenant_id,
            exception_id,
            actor_type,
            actor_id,
            json!({
                "playbook_id": playbook_id,
                "step_id": step.step_id,
                "step_order": step_order,
                "step_name": step.name,
                "action_type": step.action_type,
                "is_last_step": is_last_step,
                "notes": notes,
            }),
        );
        self.events.emit(&event).await?;

        if is_last_step {
            let completed = CanonicalEvent::new(
                event_types::PLAYBOOK_COMPLETED,
                tenant_id,
                exception_id,
                actor_type,
                actor_id,
                json!({
                    "playbook_id": playbook_id,
                    "total_steps": total_steps,
                    "notes": notes,
                }),
            );
            self.events.emit(&completed).await?;
        }
        tracing::info!(%tenant_id, %exception_id, step_order, "step skipped");
        Ok(())
    }

    async fn check_preconditions(
        &self,
        tenant_id: &str,
        exception_id: &str,
        playbook_id: i64,
        step_order: i32,
    ) -> Result<(PlaybookStepRow, usize), PlaybookExecutionError> {
        let exception = exceptions::get(&self.pool, tenant_id, exception_id)
            .await?
            .ok_or_else(|| PlaybookExecutionError::ExceptionNotFound {
                tenant_id: tenant_id.to_string(),
                exception_id: exception_id.to_string(),
            })?;

        if exception.current_playbook_id != Some(playbook_id) {
            return Err(PlaybookExecutionError::PlaybookNotActive {
                playbook_id,
                exception_id: exception_id.to_string(),
                current: exception.current_playbook_id,
            });
        }

        let steps = playbook_repo::steps(&self.pool, playbook_id).await?;
        if steps.is_empty() {
            return Err(PlaybookExecutionError::NoSteps(playbook_id));
        }
        let total_steps = steps.len();
        let step = steps
            .into_iter()
            .find(|step| step.step_order == step_order)
            .ok_or(PlaybookExecutionError::StepNotFound {
                playbook_id,
                step_order,
            })?;

        let expected = exception
            .current_step
            .ok_or_else(|| PlaybookExecutionError::NoCurrentStep(exception_id.to_string()))?;
        if step_order != expected {
            return Err(PlaybookExecutionError::WrongStep {
                step_order,
                expected,
            });
        }

        Ok((step, total_steps))
    }

    async fn step_event_exists(
        &self,
        tenant_id: &str,
        exception_id: &str,
        event_type: &str,
        playbook_id: i64,
        step_order: i32,
    ) -> Result<bool, sqlx::Error> {
        crate::db::exception_events::exists_with_payload_keys(
            &self.pool,
            tenant_id,
            exception_id,
            event_type,
            &[
                ("playbook_id", json!(playbook_id)),
                ("step_order", json!(step_order)),
            ],
        )
        .await
    }

    async fn execute_tool_step(
        &self,
        tenant_id: &str,
        exception_id: &str,
        step: &PlaybookStepRow,
        actor_type: ActorType,
        actor_id: &str,
    ) -> Result<StepToolOutcome, PlaybookExecutionError> {
        let Some(engine) = &self.tool_engine else {
            return Err(PlaybookExecutionError::InvalidToolStep(
                "tool execution engine is not wired for call_tool steps".to_string(),
            ));
        };

        let params = if step.params.is_object() {
            step.params.clone()
        } else {
            json!({})
        };
        let tool_id = params
            .get("tool_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                PlaybookExecutionError::InvalidToolStep(format!(
                    "call_tool step requires integer 'tool_id' in params, got: {}",
                    step.params
                ))
            })?;
        let payload = params
            .get("payload")
            .or_else(|| params.get("payload_template"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        if !payload.is_object() {
            return Err(PlaybookExecutionError::InvalidToolStep(format!(
                "call_tool payload must be an object, got: {payload}"
            )));
        }

        tracing::info!(%tenant_id, %exception_id, tool_id, step_order = step.step_order, "executing call_tool step");

        match engine
            .execute_tool(
                tenant_id,
                tool_id,
                payload,
                actor_type,
                actor_id,
                Some(exception_id),
            )
            .await
        {
            Ok(row) => Ok(StepToolOutcome {
                execution_id: row.id.to_string(),
                tool_id: row.tool_id,
                status: row.status.to_lowercase(),
                success: row
                    .status()
                    .map(|status| status == crate::db::tool_executions::ToolExecutionStatus::Succeeded)
                    .unwrap_or(false),
                error_message: row.error_message.clone(),
            }),
            Err(ToolExecutionError::Provider(err)) => {
                Err(PlaybookExecutionError::ToolFailed(err.to_string()))
            }
            Err(err) => Err(PlaybookExecutionError::ToolFailed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_actions_are_not_risky() {
        for action in SAFE_ACTION_TYPES {
            assert!(!is_risky_action(action));
        }
        assert!(is_risky_action("call_tool"));
        assert!(is_risky_action("restart_service"));
    }
}
