use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

/// Dead-letter lifecycle: pending -> retrying -> succeeded, or
/// pending -> discarded. Retries are admin-driven, never automatic.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetterRow {
    pub id: i64,
    pub event_id: Uuid,
    pub tenant_id: String,
    pub worker_name: String,
    pub event_payload: Value,
    pub failure_reason: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    pub discarded_by: Option<String>,
}

pub async fn insert<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    tenant_id: &str,
    worker_name: &str,
    event_payload: &Value,
    failure_reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO dead_letter_events (event_id, tenant_id, worker_name, event_payload, failure_reason, status)
        VALUES ($1, $2, $3, $4, $5, 'pending')
        ON CONFLICT (event_id, worker_name) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(tenant_id)
    .bind(worker_name)
    .bind(event_payload)
    .bind(failure_reason)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list_for_tenant<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    status: Option<&str>,
) -> Result<Vec<DeadLetterRow>, sqlx::Error> {
    match status {
        Some(status) => {
            sqlx::query_as::<_, DeadLetterRow>(
                r#"
                SELECT id, event_id, tenant_id, worker_name, event_payload,
                       failure_reason, status, created_at, retried_at,
                       discarded_at, discarded_by
                FROM dead_letter_events
                WHERE tenant_id = $1 AND status = $2
                ORDER BY created_at DESC
                "#,
            )
            .bind(tenant_id)
            .bind(status)
            .fetch_all(executor)
            .await
        }
        None => {
            sqlx::query_as::<_, DeadLetterRow>(
                r#"
                SELECT id, event_id, tenant_id, worker_name, event_payload,
                       failure_reason, status, created_at, retried_at,
                       discarded_at, discarded_by
                FROM dead_letter_events
                WHERE tenant_id = $1
                ORDER BY created_at DESC
                "#,
            )
            .bind(tenant_id)
            .fetch_all(executor)
            .await
        }
    }
}

pub async fn get<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    id: i64,
) -> Result<Option<DeadLetterRow>, sqlx::Error> {
    sqlx::query_as::<_, DeadLetterRow>(
        r#"
        SELECT id, event_id, tenant_id, worker_name, event_payload,
               failure_reason, status, created_at, retried_at,
               discarded_at, discarded_by
        FROM dead_letter_events
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn mark_retrying<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE dead_letter_events
        SET status = 'retrying', retried_at = NOW()
        WHERE tenant_id = $1 AND id = $2 AND status = 'pending'
        "#,
    )
    .bind(tenant_id)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_succeeded<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE dead_letter_events
        SET status = 'succeeded'
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn mark_discarded<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    id: i64,
    discarded_by: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE dead_letter_events
        SET status = 'discarded', discarded_at = NOW(), discarded_by = $3
        WHERE tenant_id = $1 AND id = $2 AND status IN ('pending', 'retrying')
        "#,
    )
    .bind(tenant_id)
    .bind(id)
    .bind(discarded_by)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}
