use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::events::CanonicalEvent;
use crate::tools::security::redact_secrets;

// key: event-store -> append-only

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExceptionEventRow {
    pub event_id: Uuid,
    pub exception_id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Append an event if no row with this `event_id` exists. Payloads are
/// redacted before they hit durable storage. Returns false on duplicates.
pub async fn append_if_new<'c>(
    executor: impl PgExecutor<'c>,
    event: &CanonicalEvent,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO exception_events (
            event_id, exception_id, tenant_id, event_type,
            actor_type, actor_id, payload, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event.event_id)
    .bind(event.exception_id.as_deref().unwrap_or(&event.correlation_id))
    .bind(&event.tenant_id)
    .bind(&event.event_type)
    .bind(event.actor_type.as_str())
    .bind(&event.actor_id)
    .bind(redact_secrets(&event.payload))
    .bind(event.created_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_for_exception<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
) -> Result<Vec<ExceptionEventRow>, sqlx::Error> {
    sqlx::query_as::<_, ExceptionEventRow>(
        r#"
        SELECT event_id, exception_id, tenant_id, event_type,
               actor_type, actor_id, payload, created_at
        FROM exception_events
        WHERE tenant_id = $1 AND exception_id = $2
        ORDER BY created_at, event_id
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .fetch_all(executor)
    .await
}

/// Semantic-duplicate check used by the playbook engine: does an event of
/// this type exist whose payload carries the given key fields?
pub async fn exists_with_payload_keys<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    exception_id: &str,
    event_type: &str,
    key_fields: &[(&str, Value)],
) -> Result<bool, sqlx::Error> {
    let mut expected = serde_json::Map::new();
    for (key, value) in key_fields {
        expected.insert((*key).to_string(), value.clone());
    }
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM exception_events
        WHERE tenant_id = $1 AND exception_id = $2 AND event_type = $3
          AND payload @> $4
        "#,
    )
    .bind(tenant_id)
    .bind(exception_id)
    .bind(event_type)
    .bind(Value::Object(expected))
    .fetch_one(executor)
    .await?;
    Ok(count > 0)
}

