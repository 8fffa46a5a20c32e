use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

// key: tool-execution-store -> monotonic-status

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionStatus {
    Requested,
    Running,
    Succeeded,
    Failed,
}

impl ToolExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolExecutionStatus::Requested => "REQUESTED",
            ToolExecutionStatus::Running => "RUNNING",
            ToolExecutionStatus::Succeeded => "SUCCEEDED",
            ToolExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn from_str_ci(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "REQUESTED" => Some(ToolExecutionStatus::Requested),
            "RUNNING" => Some(ToolExecutionStatus::Running),
            "SUCCEEDED" => Some(ToolExecutionStatus::Succeeded),
            "FAILED" => Some(ToolExecutionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ToolExecutionStatus::Succeeded | ToolExecutionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolExecutionRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub tool_id: i64,
    pub exception_id: Option<String>,
    pub status: String,
    pub requested_by_actor_type: String,
    pub requested_by_actor_id: String,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolExecutionRow {
    pub fn status(&self) -> Option<ToolExecutionStatus> {
        ToolExecutionStatus::from_str_ci(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct NewToolExecution {
    pub id: Uuid,
    pub tenant_id: String,
    pub tool_id: i64,
    pub exception_id: Option<String>,
    pub requested_by_actor_type: String,
    pub requested_by_actor_id: String,
    pub input_payload: Value,
}

pub async fn create<'c>(
    executor: impl PgExecutor<'c>,
    new: &NewToolExecution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tool_executions (
            id, tenant_id, tool_id, exception_id, status,
            requested_by_actor_type, requested_by_actor_id, input_payload
        )
        VALUES ($1, $2, $3, $4, 'REQUESTED', $5, $6, $7)
        "#,
    )
    .bind(new.id)
    .bind(&new.tenant_id)
    .bind(new.tool_id)
    .bind(&new.exception_id)
    .bind(&new.requested_by_actor_type)
    .bind(&new.requested_by_actor_id)
    .bind(&new.input_payload)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    execution_id: Uuid,
) -> Result<Option<ToolExecutionRow>, sqlx::Error> {
    sqlx::query_as::<_, ToolExecutionRow>(
        r#"
        SELECT id, tenant_id, tool_id, exception_id, status,
               requested_by_actor_type, requested_by_actor_id,
               input_payload, output_payload, error_message,
               created_at, updated_at
        FROM tool_executions
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(execution_id)
    .fetch_optional(executor)
    .await
}

/// Advance REQUESTED -> RUNNING. The WHERE clause refuses to touch rows that
/// moved on already, keeping the transition monotonic under redelivery.
pub async fn mark_running<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    execution_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tool_executions
        SET status = 'RUNNING', updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2 AND status = 'REQUESTED'
        "#,
    )
    .bind(tenant_id)
    .bind(execution_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_succeeded<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    execution_id: Uuid,
    output_payload: &Value,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tool_executions
        SET status = 'SUCCEEDED', output_payload = $3, updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2 AND status IN ('REQUESTED', 'RUNNING')
        "#,
    )
    .bind(tenant_id)
    .bind(execution_id)
    .bind(output_payload)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_failed<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    execution_id: Uuid,
    error_message: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tool_executions
        SET status = 'FAILED', error_message = $3, updated_at = NOW()
        WHERE tenant_id = $1 AND id = $2 AND status IN ('REQUESTED', 'RUNNING')
        "#,
    )
    .bind(tenant_id)
    .bind(execution_id)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
