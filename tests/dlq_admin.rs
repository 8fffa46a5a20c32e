mod common;

use std::sync::Arc;

use axum::{body::Body, http::{Method, Request, StatusCode}, Extension, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use resolvd::alerts::AlertEvaluator;
use resolvd::broker::{Broker, InMemoryBroker};
use resolvd::db::{dead_letters, governance_audit};
use resolvd::events::{event_types, ActorType, CanonicalEvent};
use resolvd::playbooks::PlaybookExecutionService;
use resolvd::publisher::{EventPublisher, EventSink};
use resolvd::routes::api_routes;

fn app(pool: &sqlx::PgPool) -> (Router, Arc<dyn Broker>) {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let publisher: Arc<dyn EventSink> =
        Arc::new(EventPublisher::new(pool.clone(), broker.clone()));
    let playbook_service = Arc::new(PlaybookExecutionService::new(
        pool.clone(),
        publisher.clone(),
        None,
    ));
    let evaluator = Arc::new(AlertEvaluator::with_default_rules());
    let router = api_routes()
        .layer(Extension(pool.clone()))
        .layer(Extension(broker.clone()))
        .layer(Extension(publisher))
        .layer(Extension(playbook_service))
        .layer(Extension(evaluator));
    (router, broker)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn retry_republishes_and_audits() {
    let Some(pool) = common::maybe_pool().await else {
        return;
    };
    let tenant = common::unique_tenant("dlq");
    let (app, _broker) = app(&pool);

    let event = CanonicalEvent::new(
        event_types::TRIAGE_REQUESTED,
        &tenant,
        "EXC-DLQ-1",
        ActorType::System,
        "intake-worker",
        json!({}),
    );
    dead_letters::insert(
        &pool,
        event.event_id,
        &tenant,
        "TriageWorker",
        &serde_json::to_value(&event).unwrap(),
        "retry attempts exhausted",
    )
    .await
    .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri(format!("/api/tenants/{tenant}/dlq?status=pending"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    let entries = listed["dead_letters"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let dlq_id = entries[0]["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/tenants/{tenant}/dlq/{dlq_id}/retry"))
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"actor_id": "admin"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let entry = dead_letters::get(&pool, &tenant, dlq_id).await.unwrap().unwrap();
    assert_eq!(entry.status, "succeeded");
    assert!(entry.retried_at.is_some());

    let audit = governance_audit::list_for_tenant(&pool, &tenant, 10).await.unwrap();
    assert!(audit.iter().any(|row| row.action == "dlq_retry" && row.actor_id == "admin"));

    // a second retry conflicts: the entry is no longer pending
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/tenants/{tenant}/dlq/{dlq_id}/retry"))
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"actor_id": "admin"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn discard_records_who_and_when() {
    let Some(pool) = common::maybe_pool().await else {
        return;
    };
    let tenant = common::unique_tenant("dlq-discard");
    let (app, _broker) = app(&pool);

    let event = CanonicalEvent::new(
        event_types::TRIAGE_REQUESTED,
        &tenant,
        "EXC-DLQ-2",
        ActorType::System,
        "intake-worker",
        json!({}),
    );
    dead_letters::insert(
        &pool,
        event.event_id,
        &tenant,
        "TriageWorker",
        &serde_json::to_value(&event).unwrap(),
        "retry attempts exhausted",
    )
    .await
    .unwrap();
    let entries = dead_letters::list_for_tenant(&pool, &tenant, None).await.unwrap();
    let dlq_id = entries[0].id;

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/api/tenants/{tenant}/dlq/{dlq_id}/discard"))
                .header("Content-Type", "application/json")
                .body(Body::from(json!({"actor_id": "auditor"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let entry = dead_letters::get(&pool, &tenant, dlq_id).await.unwrap().unwrap();
    assert_eq!(entry.status, "discarded");
    assert_eq!(entry.discarded_by.as_deref(), Some("auditor"));
    assert!(entry.discarded_at.is_some());

    let audit = governance_audit::list_for_tenant(&pool, &tenant, 10).await.unwrap();
    assert!(audit.iter().any(|row| row.action == "dlq_discard"));
}

#[tokio::test]
async fn dlq_listing_is_tenant_scoped() {
    let Some(pool) = common::maybe_pool().await else {
        return;
    };
    let tenant = common::unique_tenant("dlq-iso");
    let other = common::unique_tenant("dlq-iso-other");
    let (app, _broker) = app(&pool);

    let event = CanonicalEvent::new(
        event_types::TRIAGE_REQUESTED,
        &other,
        "EXC-DLQ-3",
        ActorType::System,
        "intake-worker",
        json!({}),
    );
    dead_letters::insert(
        &pool,
        event.event_id,
        &other,
        "TriageWorker",
        &serde_json::to_value(&event).unwrap(),
        "retry attempts exhausted",
    )
    .await
    .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri(format!("/api/tenants/{tenant}/dlq"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert!(listed["dead_letters"].as_array().unwrap().is_empty());
}
