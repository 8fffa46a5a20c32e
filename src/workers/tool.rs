use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{tool_definitions, tool_executions};
use crate::events::{event_types, CanonicalEvent};
use crate::observability::TenantMetrics;
use crate::tools::definition::ToolConfig;
use crate::tools::engine::{ToolExecutionEngine, ToolExecutionError};
use crate::workers::{EventProcessor, WorkerError};

/// Recovery path for `ToolExecutionRequested` events. The synchronous engine
/// usually wins the RUNNING claim; this worker picks up executions whose
/// owner crashed, and republishes completions for terminal rows on
/// redelivery.
pub struct ToolWorker {
    pool: PgPool,
    engine: Arc<ToolExecutionEngine>,
    metrics: Arc<TenantMetrics>,
}

impl ToolWorker {
    pub fn new(pool: PgPool, engine: Arc<ToolExecutionEngine>, metrics: Arc<TenantMetrics>) -> Self {
        Self {
            pool,
            engine,
            metrics,
        }
    }
}

#[async_trait]
impl EventProcessor for ToolWorker {
    fn worker_name(&self) -> &'static str {
        "ToolWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == event_types::TOOL_EXECUTION_REQUESTED
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let execution_id = event
            .payload
            .get("execution_id")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                WorkerError::Malformed("ToolExecutionRequested without execution_id".into())
            })?;
        let tenant_id = &event.tenant_id;

        // Terminal already: skip the provider, republish the completion.
        if let Some(row) = self
            .engine
            .terminal_state(tenant_id, execution_id)
            .await
            .map_err(|err| WorkerError::Failed(err.to_string()))?
        {
            tracing::info!(%tenant_id, %execution_id, status = %row.status, "execution already terminal, republishing completion");
            self.engine
                .republish_completion(&row)
                .await
                .map_err(|err| WorkerError::Failed(err.to_string()))?;
            return Ok(Vec::new());
        }

        // Claim REQUESTED -> RUNNING; losing the claim means another owner
        // (usually the synchronous engine call) is mid-flight.
        if !tool_executions::mark_running(&self.pool, tenant_id, execution_id).await? {
            tracing::debug!(%tenant_id, %execution_id, "execution owned elsewhere, skipping");
            return Ok(Vec::new());
        }

        let Some(row) = tool_executions::get(&self.pool, tenant_id, execution_id).await? else {
            return Err(WorkerError::Failed(format!(
                "claimed execution {execution_id} vanished"
            )));
        };
        let Some(tool) = tool_definitions::get_visible(&self.pool, tenant_id, row.tool_id).await?
        else {
            return Err(WorkerError::Failed(format!(
                "tool {} not visible to tenant {tenant_id}",
                row.tool_id
            )));
        };
        let tool_config = ToolConfig::parse(&tool.tool_type, &tool.config)
            .map_err(|err| WorkerError::Failed(err.to_string()))?;

        match self
            .engine
            .dispatch(
                tenant_id,
                execution_id,
                &tool,
                &tool_config,
                &row.input_payload,
                row.exception_id.as_deref(),
            )
            .await
        {
            Ok(_) => Ok(Vec::new()),
            // Provider and breaker failures are terminal outcomes the engine
            // already persisted and emitted; redelivering the request would
            // not help.
            Err(ToolExecutionError::Provider(err)) => {
                self.metrics.record_tool_failure(tenant_id);
                tracing::warn!(%tenant_id, %execution_id, error = %err, "tool dispatch failed");
                self.republish_failure(tenant_id, execution_id).await?;
                Ok(Vec::new())
            }
            Err(ToolExecutionError::CircuitOpen { .. }) => {
                self.metrics.record_tool_failure(tenant_id);
                self.republish_failure(tenant_id, execution_id).await?;
                Ok(Vec::new())
            }
            Err(ToolExecutionError::Database(err)) => Err(err.into()),
            Err(err) => Err(WorkerError::Failed(err.to_string())),
        }
    }
}

impl ToolWorker {
    /// Worker-variant failure event: `ToolExecutionCompleted` with
    /// `payload.status = "failed"`, keyed off the terminal row.
    async fn republish_failure(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
    ) -> Result<(), WorkerError> {
        if let Some(row) = self
            .engine
            .terminal_state(tenant_id, execution_id)
            .await
            .map_err(|err| WorkerError::Failed(err.to_string()))?
        {
            self.engine
                .republish_completion(&row)
                .await
                .map_err(|err| WorkerError::Failed(err.to_string()))?;
        }
        Ok(())
    }
}
