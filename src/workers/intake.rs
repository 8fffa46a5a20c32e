use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::db::exceptions::{self, NewException, Severity};
use crate::events::{event_types, ActorType, CanonicalEvent};
use crate::observability::TenantMetrics;
use crate::workers::{EventProcessor, WorkerError};

/// Creates the exception record from `ExceptionRaised` and hands off to
/// triage. Duplicate raises collapse on the `(tenant_id, exception_id)` key.
pub struct IntakeWorker {
    pool: PgPool,
    metrics: Arc<TenantMetrics>,
}

impl IntakeWorker {
    pub fn new(pool: PgPool, metrics: Arc<TenantMetrics>) -> Self {
        Self { pool, metrics }
    }
}

#[async_trait]
impl EventProcessor for IntakeWorker {
    fn worker_name(&self) -> &'static str {
        "IntakeWorker"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == event_types::EXCEPTION_RAISED
    }

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError> {
        let exception_id = event
            .exception_id
            .clone()
            .ok_or_else(|| WorkerError::Malformed("ExceptionRaised without exception_id".into()))?;
        let payload = &event.payload;

        let source_system = payload
            .get("source_system")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let exception_type = payload
            .get("exception_type")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkerError::Malformed("ExceptionRaised without exception_type".into()))?
            .to_string();
        let severity = payload
            .get("severity")
            .and_then(Value::as_str)
            .and_then(Severity::from_str_ci)
            .unwrap_or(Severity::Medium);
        let raw_payload = payload.get("raw_payload").cloned().unwrap_or_else(|| json!({}));
        let mut normalized_context = payload
            .get("normalized_context")
            .cloned()
            .unwrap_or_else(|| json!({}));
        if !normalized_context.is_object() {
            normalized_context = json!({});
        }

        let created = exceptions::insert_if_new(
            &self.pool,
            &NewException {
                exception_id: exception_id.clone(),
                tenant_id: event.tenant_id.clone(),
                source_system,
                exception_type: exception_type.clone(),
                severity,
                raw_payload,
                normalized_context,
            },
        )
        .await?;

        if created {
            self.metrics
                .record_exception(&event.tenant_id, &exception_type, severity.as_str());
        } else {
            tracing::info!(
                tenant_id = %event.tenant_id,
                %exception_id,
                "exception already ingested, continuing pipeline"
            );
        }

        Ok(vec![CanonicalEvent::new(
            event_types::TRIAGE_REQUESTED,
            &event.tenant_id,
            &exception_id,
            ActorType::System,
            "intake-worker",
            json!({ "exception_type": exception_type }),
        )])
    }
}
