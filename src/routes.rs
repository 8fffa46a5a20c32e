use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::alerts::AlertEvaluator;
use crate::broker::Broker;
use crate::db::{dead_letters, event_processing, exception_events, exceptions, governance_audit};
use crate::error::{AppError, AppResult};
use crate::events::{event_types, ActorType, CanonicalEvent, EXCEPTIONS_TOPIC};
use crate::playbooks::PlaybookExecutionService;
use crate::publisher::EventSink;

// key: api-surface -> peripheral-glue
//
// Thin HTTP surface: raise exceptions, read timelines, drive the human
// approval path, and administer the DLQ. Core behavior lives in the workers.

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/exceptions", post(raise_exception))
        .route(
            "/api/tenants/:tenant_id/exceptions/:exception_id",
            get(get_exception),
        )
        .route(
            "/api/tenants/:tenant_id/exceptions/:exception_id/events",
            get(list_exception_events),
        )
        .route(
            "/api/tenants/:tenant_id/exceptions/:exception_id/steps/:step_order/complete",
            post(complete_step),
        )
        .route(
            "/api/tenants/:tenant_id/exceptions/:exception_id/steps/:step_order/skip",
            post(skip_step),
        )
        .route("/api/tenants/:tenant_id/dlq", get(list_dead_letters))
        .route("/api/tenants/:tenant_id/dlq/:id/retry", post(retry_dead_letter))
        .route(
            "/api/tenants/:tenant_id/dlq/:id/discard",
            post(discard_dead_letter),
        )
        .route("/api/tenants/:tenant_id/alerts", get(list_alerts))
        .route("/api/health", get(health))
}

#[derive(Debug, Deserialize)]
pub struct RaiseExceptionRequest {
    pub tenant_id: String,
    pub exception_id: String,
    pub source_system: String,
    pub exception_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub raw_payload: Value,
    #[serde(default)]
    pub normalized_context: Value,
}

/// Publishes `ExceptionRaised`; the intake worker owns record creation.
async fn raise_exception(
    Extension(publisher): Extension<Arc<dyn EventSink>>,
    Json(request): Json<RaiseExceptionRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if request.tenant_id.trim().is_empty() || request.exception_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "tenant_id and exception_id are required".to_string(),
        ));
    }
    let event = CanonicalEvent::new(
        event_types::EXCEPTION_RAISED,
        &request.tenant_id,
        &request.exception_id,
        ActorType::System,
        "api",
        json!({
            "source_system": request.source_system,
            "exception_type": request.exception_type,
            "severity": request.severity,
            "raw_payload": request.raw_payload,
            "normalized_context": request.normalized_context,
        }),
    );
    publisher.emit(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "event_id": event.event_id })),
    ))
}

async fn get_exception(
    Extension(pool): Extension<PgPool>,
    Path((tenant_id, exception_id)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let exception = exceptions::get(&pool, &tenant_id, &exception_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(json!({
        "exception_id": exception.exception_id,
        "tenant_id": exception.tenant_id,
        "source_system": exception.source_system,
        "exception_type": exception.exception_type,
        "severity": exception.severity,
        "resolution_status": exception.resolution_status,
        "current_playbook_id": exception.current_playbook_id,
        "current_step": exception.current_step,
        "created_at": exception.created_at,
        "updated_at": exception.updated_at,
    })))
}

async fn list_exception_events(
    Extension(pool): Extension<PgPool>,
    Path((tenant_id, exception_id)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let events = exception_events::list_for_exception(&pool, &tenant_id, &exception_id).await?;
    let events: Vec<Value> = events
        .into_iter()
        .map(|event| {
            json!({
                "event_id": event.event_id,
                "event_type": event.event_type,
                "actor_type": event.actor_type,
                "actor_id": event.actor_id,
                "payload": event.payload,
                "created_at": event.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "events": events })))
}

#[derive(Debug, Deserialize)]
pub struct StepActionRequest {
    pub playbook_id: i64,
    pub actor_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Human approval path: completions through the API always carry a USER
/// actor, which is what lets risky steps pass the gate.
async fn complete_step(
    Extension(service): Extension<Arc<PlaybookExecutionService>>,
    Path((tenant_id, exception_id, step_order)): Path<(String, String, i32)>,
    Json(request): Json<StepActionRequest>,
) -> AppResult<StatusCode> {
    service
        .complete_step(
            &tenant_id,
            &exception_id,
            request.playbook_id,
            step_order,
            ActorType::User,
            &request.actor_id,
            request.notes.as_deref(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn skip_step(
    Extension(service): Extension<Arc<PlaybookExecutionService>>,
    Path((tenant_id, exception_id, step_order)): Path<(String, String, i32)>,
    Json(request): Json<StepActionRequest>,
) -> AppResult<StatusCode> {
    service
        .skip_step(
            &tenant_id,
            &exception_id,
            request.playbook_id,
            step_order,
            ActorType::User,
            &request.actor_id,
            request.notes.as_deref(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    #[serde(default)]
    pub status: Option<String>,
}

async fn list_dead_letters(
    Extension(pool): Extension<PgPool>,
    Path(tenant_id): Path<String>,
    Query(query): Query<DlqQuery>,
) -> AppResult<Json<Value>> {
    let rows = dead_letters::list_for_tenant(&pool, &tenant_id, query.status.as_deref()).await?;
    let entries: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "id": row.id,
                "event_id": row.event_id,
                "worker_name": row.worker_name,
                "failure_reason": row.failure_reason,
                "status": row.status,
                "created_at": row.created_at,
                "retried_at": row.retried_at,
                "discarded_at": row.discarded_at,
                "discarded_by": row.discarded_by,
            })
        })
        .collect();
    Ok(Json(json!({ "dead_letters": entries })))
}

#[derive(Debug, Deserialize)]
pub struct DlqActionRequest {
    pub actor_id: String,
}

/// Admin retry: clears the ledger row for the failed worker and republishes
/// the stored event. No automatic retries exist; this is the only path back.
async fn retry_dead_letter(
    Extension(pool): Extension<PgPool>,
    Extension(broker): Extension<Arc<dyn Broker>>,
    Path((tenant_id, id)): Path<(String, i64)>,
    Json(request): Json<DlqActionRequest>,
) -> AppResult<StatusCode> {
    let entry = dead_letters::get(&pool, &tenant_id, id)
        .await?
        .ok_or(AppError::NotFound)?;
    if !dead_letters::mark_retrying(&pool, &tenant_id, id).await? {
        return Err(AppError::Conflict(format!(
            "dead letter {id} is not pending (status: {})",
            entry.status
        )));
    }

    let event: CanonicalEvent = serde_json::from_value(entry.event_payload.clone())
        .map_err(|err| AppError::Message(format!("stored event is unreadable: {err}")))?;
    event_processing::clear(&pool, entry.event_id, &entry.worker_name).await?;
    broker
        .publish(EXCEPTIONS_TOPIC, event.partition_key(), &event)
        .await
        .map_err(|err| AppError::Message(err.to_string()))?;
    dead_letters::mark_succeeded(&pool, &tenant_id, id).await?;

    governance_audit::append(
        &pool,
        &tenant_id,
        &request.actor_id,
        "dlq_retry",
        &json!({ "dead_letter_id": id, "event_id": entry.event_id, "worker_name": entry.worker_name }),
    )
    .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn discard_dead_letter(
    Extension(pool): Extension<PgPool>,
    Path((tenant_id, id)): Path<(String, i64)>,
    Json(request): Json<DlqActionRequest>,
) -> AppResult<StatusCode> {
    if !dead_letters::mark_discarded(&pool, &tenant_id, id, &request.actor_id).await? {
        return Err(AppError::Conflict(format!(
            "dead letter {id} is not discardable"
        )));
    }
    governance_audit::append(
        &pool,
        &tenant_id,
        &request.actor_id,
        "dlq_discard",
        &json!({ "dead_letter_id": id }),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_alerts(
    Extension(evaluator): Extension<Arc<AlertEvaluator>>,
    Path(tenant_id): Path<String>,
) -> Json<Value> {
    let alerts = evaluator.active_alerts(Some(&tenant_id));
    Json(json!({ "alerts": alerts }))
}

async fn health(
    Extension(pool): Extension<PgPool>,
    Extension(broker): Extension<Arc<dyn Broker>>,
) -> AppResult<Json<Value>> {
    let db_ok = sqlx::query("SELECT 1").execute(&pool).await.is_ok();
    let broker_health = broker.health().await;
    Ok(Json(json!({
        "database": if db_ok { "ok" } else { "down" },
        "broker": broker_health,
    })))
}
