use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

// key: idempotency-ledger
//
// One row per (event_id, worker_name). The table is the single source of
// truth; in-process caching of ledger state is forbidden.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDecision {
    /// Row claimed; the caller owns processing of this event.
    Claimed,
    /// Already completed, or another consumer currently owns it.
    Skip,
    /// Retries exhausted; the caller should route the event to the DLQ.
    Exhausted,
}

/// Atomically claim the `(event_id, worker_name)` row inside the caller's
/// transaction. Re-opens `failed` rows while attempts remain below the cap.
pub async fn try_begin<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
    max_attempts: i32,
) -> Result<LedgerDecision, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO event_processing (event_id, worker_name, status, attempts)
        VALUES ($1, $2, 'processing', 0)
        ON CONFLICT (event_id, worker_name) DO UPDATE
        SET status = 'processing',
            started_at = NOW(),
            updated_at = NOW()
        WHERE event_processing.status = 'failed'
          AND event_processing.attempts < $3
        RETURNING attempts
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .bind(max_attempts)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(_) => Ok(LedgerDecision::Claimed),
        None => Ok(LedgerDecision::Skip),
    }
}

/// Inspect a row that refused the claim: distinguishes "done/owned" from
/// "retries exhausted".
pub async fn classify_skip<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
    max_attempts: i32,
) -> Result<LedgerDecision, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT status, attempts FROM event_processing
        WHERE event_id = $1 AND worker_name = $2
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .fetch_optional(executor)
    .await?;

    let Some(row) = row else {
        // Row vanished between claim and inspection; treat as skip, the next
        // delivery will claim it.
        return Ok(LedgerDecision::Skip);
    };
    let status: String = row.get("status");
    let attempts: i32 = row.get("attempts");
    if status == "failed" && attempts >= max_attempts {
        return Ok(LedgerDecision::Exhausted);
    }
    Ok(LedgerDecision::Skip)
}

pub async fn mark_completed<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE event_processing
        SET status = 'completed', error = NULL, updated_at = NOW()
        WHERE event_id = $1 AND worker_name = $2
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record a failed run. Upserts so a claim lost to a connection failure
/// still leaves a trace; the attempt counter advances exactly once per
/// failed run.
pub async fn mark_failed<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
    error: &str,
) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO event_processing (event_id, worker_name, status, attempts, error)
        VALUES ($1, $2, 'failed', 1, $3)
        ON CONFLICT (event_id, worker_name) DO UPDATE
        SET status = 'failed',
            attempts = event_processing.attempts + 1,
            error = EXCLUDED.error,
            updated_at = NOW()
        RETURNING attempts
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .bind(error)
    .fetch_one(executor)
    .await
}

/// Reaper: re-open `processing` rows whose owner crashed. They become
/// `failed` so the retry path can reclaim them.
pub async fn reap_stale<'c>(
    executor: impl PgExecutor<'c>,
    stale_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE event_processing
        SET status = 'failed', error = 'reaped: stale processing row', updated_at = NOW()
        WHERE status = 'processing' AND started_at < $1
        "#,
    )
    .bind(stale_before)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Remove the ledger row so an admin DLQ retry can reprocess the event from
/// scratch.
pub async fn clear<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        DELETE FROM event_processing
        WHERE event_id = $1 AND worker_name = $2
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn status_of<'c>(
    executor: impl PgExecutor<'c>,
    event_id: Uuid,
    worker_name: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT status FROM event_processing
        WHERE event_id = $1 AND worker_name = $2
        "#,
    )
    .bind(event_id)
    .bind(worker_name)
    .fetch_optional(executor)
    .await
}
