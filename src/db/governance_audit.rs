use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;

/// Append-only audit of admin actions (DLQ retries, discards, enablement
/// flips). Never updated or deleted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GovernanceAuditRow {
    pub id: i64,
    pub tenant_id: String,
    pub actor_id: String,
    pub action: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

pub async fn append<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    actor_id: &str,
    action: &str,
    details: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO governance_audit_events (tenant_id, actor_id, action, details)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(tenant_id)
    .bind(actor_id)
    .bind(action)
    .bind(details)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_for_tenant<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    limit: i64,
) -> Result<Vec<GovernanceAuditRow>, sqlx::Error> {
    sqlx::query_as::<_, GovernanceAuditRow>(
        r#"
        SELECT id, tenant_id, actor_id, action, details, created_at
        FROM governance_audit_events
        WHERE tenant_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(tenant_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}
