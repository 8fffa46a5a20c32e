use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::db::tool_definitions::ToolDefinitionRow;
use crate::db::tool_executions::{self, NewToolExecution, ToolExecutionRow, ToolExecutionStatus};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::packs::PackRegistry;
use crate::publisher::{EventSink, PublishError};
use crate::safety::ViolationDetector;
use crate::tools::breaker::CircuitBreakerRegistry;
use crate::tools::definition::{ToolConfig, ToolConfigError};
use crate::tools::provider::{
    DummyToolProvider, HttpToolProvider, ProviderOptions, ToolProvider, ToolProviderError,
};
use crate::tools::security::redact_secrets;
use crate::tools::validation::{ToolValidationError, ToolValidationService};

// key: tool-engine -> lifecycle,circuit-breaker
//
// Drives REQUESTED -> RUNNING -> (SUCCEEDED | FAILED) with the record
// persisted before any event is published. The engine only sees events
// through the EventSink capability, never the full bus.

const AUTH_VIOLATION_AFTER: u32 = 2;

#[derive(Debug, Error)]
pub enum ToolExecutionError {
    #[error(transparent)]
    Validation(#[from] ToolValidationError),
    #[error("invalid tool config: {0}")]
    Config(#[from] ToolConfigError),
    #[error("circuit breaker open for tool {tool_id} (tenant '{tenant_id}')")]
    CircuitOpen { tenant_id: String, tool_id: i64 },
    #[error(transparent)]
    Provider(#[from] ToolProviderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event emission failed: {0}")]
    Publish(#[from] PublishError),
    #[error("terminal execution state violated for {0}")]
    TerminalOverwrite(Uuid),
}

pub struct ToolExecutionEngine {
    pool: PgPool,
    validation: ToolValidationService,
    breakers: Arc<CircuitBreakerRegistry>,
    http_provider: HttpToolProvider,
    dummy_provider: DummyToolProvider,
    events: Arc<dyn EventSink>,
    packs: Arc<PackRegistry>,
    violations: Arc<ViolationDetector>,
    auth_failures: DashMap<(String, i64), u32>,
}

impl ToolExecutionEngine {
    pub fn new(
        pool: PgPool,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<dyn EventSink>,
        packs: Arc<PackRegistry>,
        violations: Arc<ViolationDetector>,
    ) -> Self {
        Self {
            validation: ToolValidationService::new(pool.clone()),
            pool,
            breakers,
            http_provider: HttpToolProvider::new(),
            dummy_provider: DummyToolProvider::default(),
            events,
            packs,
            violations,
            auth_failures: DashMap::new(),
        }
    }

    fn provider_for(&self, tool_type: &str) -> &dyn ToolProvider {
        if self.http_provider.supports_tool_type(tool_type) {
            &self.http_provider
        } else {
            &self.dummy_provider
        }
    }

    fn provider_options(&self, tenant_id: &str, tool_name: &str) -> ProviderOptions {
        let Some(policy) = self.packs.tenant_policy(tenant_id) else {
            return ProviderOptions::default();
        };
        let Some(overrides) = policy.tool_override(tool_name) else {
            return ProviderOptions::default();
        };
        ProviderOptions {
            timeout_seconds: overrides.timeout_seconds,
            max_retries: overrides.max_retries,
        }
    }

    /// Full lifecycle for one invocation. Validation failures surface before
    /// any record exists; provider failures land in a FAILED record plus a
    /// `ToolExecutionFailed` event.
    pub async fn execute_tool(
        &self,
        tenant_id: &str,
        tool_id: i64,
        payload: Value,
        actor_type: ActorType,
        actor_id: &str,
        exception_id: Option<&str>,
    ) -> Result<ToolExecutionRow, ToolExecutionError> {
        let tool = self.validation.check_tenant_scope(tenant_id, tool_id).await?;
        let tool_config = ToolConfig::parse(&tool.tool_type, &tool.config)?;
        self.validation.check_tool_enabled(tenant_id, tool_id).await?;
        self.validation
            .validate_payload(&tool, tool_config.input_schema.as_ref(), &payload)?;

        let execution_id = Uuid::new_v4();
        let new = NewToolExecution {
            id: execution_id,
            tenant_id: tenant_id.to_string(),
            tool_id,
            exception_id: exception_id.map(str::to_string),
            requested_by_actor_type: actor_type.as_str().to_string(),
            requested_by_actor_id: actor_id.to_string(),
            input_payload: redact_secrets(&payload),
        };
        tool_executions::create(&self.pool, &new).await?;
        tracing::info!(%tenant_id, tool_id, %execution_id, "tool execution requested");

        self.emit_requested(tenant_id, execution_id, &tool, exception_id, actor_type, actor_id)
            .await?;

        if !tool_executions::mark_running(&self.pool, tenant_id, execution_id).await? {
            // Someone else claimed the row between create and claim; return
            // whatever state it reached.
            let row = tool_executions::get(&self.pool, tenant_id, execution_id)
                .await?
                .ok_or(ToolExecutionError::TerminalOverwrite(execution_id))?;
            return Ok(row);
        }

        self.dispatch(tenant_id, execution_id, &tool, &tool_config, &payload, exception_id)
            .await
    }

    /// Provider dispatch for a claimed RUNNING execution. Also used by the
    /// tool worker after it wins the claim on a redelivered request.
    pub async fn dispatch(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        tool: &ToolDefinitionRow,
        tool_config: &ToolConfig,
        payload: &Value,
        exception_id: Option<&str>,
    ) -> Result<ToolExecutionRow, ToolExecutionError> {
        if !self.breakers.can_execute(tenant_id, tool.tool_id) {
            let message = format!("circuit breaker open for tool '{}'", tool.name);
            self.finish_failed(tenant_id, execution_id, tool, exception_id, &message)
                .await?;
            return Err(ToolExecutionError::CircuitOpen {
                tenant_id: tenant_id.to_string(),
                tool_id: tool.tool_id,
            });
        }

        let options = self.provider_options(tenant_id, &tool.name);
        let provider = self.provider_for(&tool.tool_type);
        match provider.execute(tool, tool_config, payload, &options).await {
            Ok(output) => {
                self.breakers.record_success(tenant_id, tool.tool_id);
                self.auth_failures
                    .remove(&(tenant_id.to_string(), tool.tool_id));
                let redacted_output = redact_secrets(&output);
                let updated = tool_executions::mark_succeeded(
                    &self.pool,
                    tenant_id,
                    execution_id,
                    &redacted_output,
                )
                .await?;
                if !updated {
                    tracing::error!(%execution_id, "attempted terminal overwrite on succeeded execution");
                    return Err(ToolExecutionError::TerminalOverwrite(execution_id));
                }
                self.emit_completed(
                    tenant_id,
                    execution_id,
                    tool,
                    exception_id,
                    "succeeded",
                    Some(&redacted_output),
                    None,
                )
                .await?;
                let row = tool_executions::get(&self.pool, tenant_id, execution_id)
                    .await?
                    .ok_or(ToolExecutionError::TerminalOverwrite(execution_id))?;
                Ok(row)
            }
            Err(provider_error) => {
                if provider_error.is_transient() {
                    self.breakers.record_failure(tenant_id, tool.tool_id);
                }
                if matches!(provider_error, ToolProviderError::Auth { .. }) {
                    let mut entry = self
                        .auth_failures
                        .entry((tenant_id.to_string(), tool.tool_id))
                        .or_insert(0);
                    *entry += 1;
                    if *entry >= AUTH_VIOLATION_AFTER {
                        self.violations.record_tool_auth_failure(
                            tenant_id,
                            tool.tool_id,
                            &tool.name,
                            *entry,
                        );
                    }
                }
                let message = provider_error.to_string();
                self.finish_failed(tenant_id, execution_id, tool, exception_id, &message)
                    .await?;
                Err(ToolExecutionError::Provider(provider_error))
            }
        }
    }

    async fn finish_failed(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        tool: &ToolDefinitionRow,
        exception_id: Option<&str>,
        message: &str,
    ) -> Result<(), ToolExecutionError> {
        let updated =
            tool_executions::mark_failed(&self.pool, tenant_id, execution_id, message).await?;
        if !updated {
            tracing::error!(%execution_id, "attempted terminal overwrite on failed execution");
            return Err(ToolExecutionError::TerminalOverwrite(execution_id));
        }
        tracing::error!(%tenant_id, tool_id = tool.tool_id, %execution_id, error = %message, "tool execution failed");
        self.emit_completed(
            tenant_id,
            execution_id,
            tool,
            exception_id,
            "failed",
            None,
            Some(message),
        )
        .await?;
        Ok(())
    }

    async fn emit_requested(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        tool: &ToolDefinitionRow,
        exception_id: Option<&str>,
        actor_type: ActorType,
        actor_id: &str,
    ) -> Result<(), PublishError> {
        let correlation = exception_id
            .map(str::to_string)
            .unwrap_or_else(|| execution_id.to_string());
        let event = CanonicalEvent::new(
            event_types::TOOL_EXECUTION_REQUESTED,
            tenant_id,
            &correlation,
            actor_type,
            actor_id,
            json!({
                "execution_id": execution_id.to_string(),
                "tool_id": tool.tool_id,
                "tool_name": tool.name,
            }),
        );
        self.events.emit(&event).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_completed(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        tool: &ToolDefinitionRow,
        exception_id: Option<&str>,
        status: &str,
        output: Option<&Value>,
        error_message: Option<&str>,
    ) -> Result<(), PublishError> {
        let mut payload = json!({
            "execution_id": execution_id.to_string(),
            "tool_id": tool.tool_id,
            "tool_name": tool.name,
            "status": status,
        });
        if let Some(output) = output {
            payload["output"] = output.clone();
        }
        if let Some(error_message) = error_message {
            payload["error_message"] = Value::String(error_message.to_string());
        }
        // The synchronous path emits the distinct failure type; the tool
        // worker republishes completions keyed on payload.status instead.
        let event_type = if status == "failed" {
            event_types::TOOL_EXECUTION_FAILED
        } else {
            event_types::TOOL_EXECUTION_COMPLETED
        };
        let correlation = exception_id
            .map(str::to_string)
            .unwrap_or_else(|| execution_id.to_string());
        let event = CanonicalEvent::new(
            event_type,
            tenant_id,
            &correlation,
            ActorType::System,
            "tool-engine",
            payload,
        );
        self.events.emit(&event).await
    }

    /// Idempotency check for the tool worker: a terminal row means "skip the
    /// provider, republish the completion".
    pub async fn terminal_state(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<Option<ToolExecutionRow>, ToolExecutionError> {
        let row = tool_executions::get(&self.pool, tenant_id, execution_id).await?;
        Ok(row.filter(|row| row.status().map(|s| s.is_terminal()).unwrap_or(false)))
    }

    pub async fn republish_completion(
        &self,
        row: &ToolExecutionRow,
    ) -> Result<(), ToolExecutionError> {
        let status = match row.status() {
            Some(ToolExecutionStatus::Succeeded) => "succeeded",
            _ => "failed",
        };
        let execution_ref = row.id.to_string();
        let correlation = row.exception_id.as_deref().unwrap_or(&execution_ref);
        let event = CanonicalEvent::new(
            event_types::TOOL_EXECUTION_COMPLETED,
            &row.tenant_id,
            correlation,
            ActorType::System,
            "tool-worker",
            json!({
                "execution_id": row.id.to_string(),
                "tool_id": row.tool_id,
                "status": status,
                "output": row.output_payload,
                "error_message": row.error_message,
                "replayed": true,
            }),
        );
        self.events.emit(&event).await?;
        Ok(())
    }
}
