use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn from_str_ci(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Open,
    InProgress,
    Escalated,
    Resolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Open => "OPEN",
            ResolutionStatus::InProgress => "IN_PROGRESS",
            ResolutionStatus::Escalated => "ESCALATED",
            ResolutionStatus::Resolved => "RESOLVED",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExceptionRow {
    pub exception_id: String,
    pub tenant_id: String,
    pub source_system: String,
    pub exception_type: String,
    pub severity: String,
    pub resolution_status: String,
    pub raw_payload: Value,
    pub normalized_context: Value,
    pub current_playbook_id: Option<i64>,
    pub current_step: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExceptionRow {
    pub fn severity(&self) -> Option<Severity> {
        Severity::from_str_ci(&self.severity)
    }

    pub fn domain(&self) -> Option<&str> {
        self.normalized_context
            .get("domain")
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewException {
    pub exception_id: String,
    pub tenant_id: String,
    pub source_system: String,
    pub exception_type: String,
    pub severity: Severity,
    pub raw_payload: Value,
    pub normalized_context: Value,
}

/// Insert an exception if it does not exist yet. Returns false when the row
/// was already present (duplicate `ExceptionRaised` delivery).
pub async fn insert_if_new<'c>(
    executor: impl PgExecutor<'c>,
    new: &NewException,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO exceptions (
            exception_id, tenant_id, source_system, exception_type,
            severity, resolution_status, raw_payload, normalized_context
        )
        VALUES ($1, $2, $3, $4, $5, 'OPEN', $6, $7)
        ON CONFLICT (tenant_id, exception_id) DO NOTHING
        "#,
    )
    .bind(&new.exception_id)
    .bind(&new.tenant_id)
    .bind(&new.source_system)
    .bind(&new.exception_type)
    .bind(new.severity.as_str())
    .bind(&new.raw_payload)
    .bind(&new.normalized_context)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
) -> Result<Option<ExceptionRow>, sqlx::Error> {
    sqlx::query_as::<_, ExceptionRow>(
        r#"
        SELECT exception_id, tenant_id, source_system, exception_type,
               severity, resolution_status, raw_payload, normalized_context,
               current_playbook_id, current_step, created_at, updated_at
        FROM exceptions
        WHERE tenant_id = $1 AND exception_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_optional(executor)
    .await
}

pub async fn update_triage<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
    severity: Severity,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE exceptions
        SET severity = $3, resolution_status = 'IN_PROGRESS', updated_at = NOW()
        WHERE tenant_id = $1 AND exception_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(severity.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_playbook<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
    playbook_id: i64,
    current_step: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE exceptions
        SET current_playbook_id = $3, current_step = $4, updated_at = NOW()
        WHERE tenant_id = $1 AND exception_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(playbook_id)
    .bind(current_step)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_current_step<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
    current_step: Option<i32>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE exceptions
        SET current_step = $3, updated_at = NOW()
        WHERE tenant_id = $1 AND exception_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(current_step)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn set_status<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
    status: ResolutionStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE exceptions
        SET resolution_status = $3, updated_at = NOW()
        WHERE tenant_id = $1 AND exception_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(status.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

