mod common;

use std::sync::{Arc, Once};
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use resolvd::alerts::{AlertEvaluator, AlertRuleType};
use resolvd::broker::InMemoryBroker;
use resolvd::db::{tool_definitions, tool_executions};
use resolvd::events::{event_types, ActorType, CanonicalEvent};
use resolvd::observability::TenantMetrics;
use resolvd::packs::{PackRegistry, TenantPolicyPack};
use resolvd::publisher::{EventPublisher, EventSink};
use resolvd::safety::{ViolationDetector, ViolationStore};
use resolvd::tools::breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
use resolvd::tools::engine::{ToolExecutionEngine, ToolExecutionError};
use resolvd::workers::tool::ToolWorker;
use resolvd::workers::EventProcessor;

static TOOL_ENV: Once = Once::new();

fn init_tool_env() {
    TOOL_ENV.call_once(|| {
        std::env::set_var("TOOL_ALLOWED_DOMAINS", "127.0.0.1,api.example.com");
        std::env::set_var("TOOL_ALLOWED_SCHEMES", "https,http");
    });
}

struct Harness {
    pool: sqlx::PgPool,
    engine: Arc<ToolExecutionEngine>,
    breakers: Arc<CircuitBreakerRegistry>,
    packs: Arc<PackRegistry>,
    tenant: String,
    _violation_dir: tempfile::TempDir,
}

async fn harness(recovery: Duration) -> Option<Harness> {
    init_tool_env();
    let pool = common::maybe_pool().await?;
    let tenant = common::unique_tenant("tool");
    let broker = Arc::new(InMemoryBroker::default());
    let publisher: Arc<dyn EventSink> = Arc::new(EventPublisher::new(pool.clone(), broker));
    let packs = Arc::new(PackRegistry::new());
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
        failure_threshold: 5,
        recovery_timeout: recovery,
        success_threshold: 2,
    }));
    let tmp = tempfile::tempdir().unwrap();
    let detector = Arc::new(ViolationDetector::new(Arc::new(ViolationStore::new(
        tmp.path(),
    ))));
    let engine = Arc::new(ToolExecutionEngine::new(
        pool.clone(),
        breakers.clone(),
        publisher,
        packs.clone(),
        detector,
    ));
    Some(Harness {
        pool,
        engine,
        breakers,
        packs,
        tenant,
        _violation_dir: tmp,
    })
}

fn http_tool_config(url: &str) -> serde_json::Value {
    json!({
        "description": "integration test tool",
        "inputSchema": {"type": "object"},
        "outputSchema": {"type": "object"},
        "authType": "none",
        "endpointConfig": {"url": url, "method": "POST"},
    })
}

fn fast_retry_policy(tenant: &str, tool_name: &str) -> TenantPolicyPack {
    serde_json::from_value(json!({
        "tenantId": tenant,
        "domainName": "billing",
        "toolOverrides": [{"toolName": tool_name, "maxRetries": 0, "timeoutSeconds": 2.0}],
    }))
    .unwrap()
}

#[tokio::test]
async fn circuit_opens_after_five_failures_and_recovers() {
    let Some(h) = harness(Duration::from_millis(300)).await else {
        return;
    };
    let server = MockServer::start_async().await;
    let mut failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/run");
            then.status(500).body("boom");
        })
        .await;

    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "flaky",
        "http",
        &http_tool_config(&server.url("/run")),
    )
    .await
    .unwrap();
    h.packs
        .register_tenant_policy(fast_retry_policy(&h.tenant, "flaky"))
        .unwrap();

    for _ in 0..5 {
        let err = h
            .engine
            .execute_tool(&h.tenant, tool_id, json!({}), ActorType::Agent, "tester", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolExecutionError::Provider(_)));
    }
    assert_eq!(failing.hits_async().await, 5);
    assert_eq!(h.breakers.state(&h.tenant, tool_id), CircuitState::Open);

    // sixth call refused without dispatch
    let err = h
        .engine
        .execute_tool(&h.tenant, tool_id, json!({}), ActorType::Agent, "tester", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolExecutionError::CircuitOpen { .. }));
    assert_eq!(failing.hits_async().await, 5);

    // the breaker state surfaces as an alert
    let evaluator = AlertEvaluator::with_default_rules();
    let metrics = TenantMetrics::new();
    let snapshot = metrics.snapshot(&h.tenant, h.breakers.open_circuits(&h.tenant));
    let fired = evaluator.evaluate(&h.tenant, &snapshot);
    assert!(fired
        .iter()
        .any(|alert| alert.rule_type == AlertRuleType::ToolCircuitBreakerOpen));

    // after the recovery timeout one probe is allowed; two successes close
    failing.delete_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/run");
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    for _ in 0..2 {
        h.engine
            .execute_tool(&h.tenant, tool_id, json!({}), ActorType::Agent, "tester", None)
            .await
            .unwrap();
    }
    assert_eq!(h.breakers.state(&h.tenant, tool_id), CircuitState::Closed);
}

#[tokio::test]
async fn url_allow_list_blocks_pre_dispatch() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "blocked",
        "http",
        &http_tool_config("http://localhost/x"),
    )
    .await
    .unwrap();

    let err = h
        .engine
        .execute_tool(&h.tenant, tool_id, json!({}), ActorType::Agent, "tester", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("URL validation failed"));

    // the record exists and is FAILED; no dispatch happened
    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tool_executions WHERE tenant_id = $1 AND tool_id = $2 AND status = 'FAILED'")
            .bind(&h.tenant)
            .bind(tool_id)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn api_key_auth_is_injected_from_env() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    std::env::set_var("TOOL_NOTIFIER_API_KEY", "test-key-123");
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/notify")
                .header("Authorization", "Bearer test-key-123")
                .header("Content-Type", "application/json");
            then.status(200).json_body(json!({"delivered": true}));
        })
        .await;

    let mut config = http_tool_config(&server.url("/notify"));
    config["authType"] = json!("api_key");
    let tool_id = tool_definitions::insert(&h.pool, None, "notifier", "http", &config)
        .await
        .unwrap();

    let row = h
        .engine
        .execute_tool(&h.tenant, tool_id, json!({"msg": "hi"}), ActorType::Agent, "tester", None)
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(row.status, "SUCCEEDED");
    assert_eq!(row.output_payload.unwrap()["delivered"], true);
}

#[tokio::test]
async fn duplicate_requested_event_executes_once() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "echo",
        "dummy",
        &json!({"description": "echo"}),
    )
    .await
    .unwrap();

    let row = h
        .engine
        .execute_tool(
            &h.tenant,
            tool_id,
            json!({"ticket": 7}),
            ActorType::Agent,
            "tester",
            Some("EXC-DUP-TOOL"),
        )
        .await
        .unwrap();
    assert_eq!(row.status, "SUCCEEDED");

    // redeliver the same ToolExecutionRequested twice to the worker
    let worker = ToolWorker::new(h.pool.clone(), h.engine.clone(), Arc::new(TenantMetrics::new()));
    let event = CanonicalEvent::new(
        event_types::TOOL_EXECUTION_REQUESTED,
        &h.tenant,
        "EXC-DUP-TOOL",
        ActorType::Agent,
        "tester",
        json!({"execution_id": row.id.to_string(), "tool_id": tool_id}),
    );
    worker.process(&event).await.unwrap();
    worker.process(&event).await.unwrap();

    let stored = tool_executions::get(&h.pool, &h.tenant, row.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, "SUCCEEDED");
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tool_executions WHERE tenant_id = $1 AND tool_id = $2",
    )
    .bind(&h.tenant)
    .bind(tool_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(count, 1, "duplicate delivery created a second execution");
}

#[tokio::test]
async fn secrets_are_redacted_in_rows_and_events() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "echo-secrets",
        "dummy",
        &json!({"description": "echo"}),
    )
    .await
    .unwrap();

    let row = h
        .engine
        .execute_tool(
            &h.tenant,
            tool_id,
            json!({"service": "billing", "api_key": "sk-live-secret"}),
            ActorType::Agent,
            "tester",
            Some("EXC-REDACT"),
        )
        .await
        .unwrap();

    assert_eq!(row.input_payload["api_key"], "[REDACTED]");
    let output = row.output_payload.unwrap();
    assert_eq!(output["echo"]["api_key"], "[REDACTED]");
    assert_eq!(output["echo"]["service"], "billing");

    let events = resolvd::db::exception_events::list_for_exception(&h.pool, &h.tenant, "EXC-REDACT")
        .await
        .unwrap();
    for event in events {
        let rendered = event.payload.to_string();
        assert!(
            !rendered.contains("sk-live-secret"),
            "raw secret leaked into event {}",
            event.event_type
        );
    }
}

#[tokio::test]
async fn schema_validation_rejects_before_any_record() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let config = json!({
        "description": "strict tool",
        "inputSchema": {
            "type": "object",
            "required": ["service"],
            "properties": {"service": {"type": "string"}},
        },
        "authType": "none",
    });
    let tool_id = tool_definitions::insert(&h.pool, Some(&h.tenant), "strict", "dummy", &config)
        .await
        .unwrap();

    let err = h
        .engine
        .execute_tool(&h.tenant, tool_id, json!({"service": 42}), ActorType::Agent, "tester", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolExecutionError::Validation(_)));

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tool_executions WHERE tenant_id = $1 AND tool_id = $2",
    )
    .bind(&h.tenant)
    .bind(tool_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn tenant_scoped_tool_is_invisible_to_other_tenants() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let other = common::unique_tenant("other");
    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&other),
        "private",
        "dummy",
        &json!({"description": "private tool"}),
    )
    .await
    .unwrap();

    let err = h
        .engine
        .execute_tool(&h.tenant, tool_id, json!({}), ActorType::Agent, "tester", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not accessible"));
}

#[tokio::test]
async fn call_tool_step_runs_tool_and_embeds_result() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let exception_id = "EXC-CALLTOOL-1";
    resolvd::db::exceptions::insert_if_new(
        &h.pool,
        &resolvd::db::exceptions::NewException {
            exception_id: exception_id.into(),
            tenant_id: h.tenant.clone(),
            source_system: "billing".into(),
            exception_type: "DataQualityFailure".into(),
            severity: resolvd::db::exceptions::Severity::Medium,
            raw_payload: json!({}),
            normalized_context: json!({}),
        },
    )
    .await
    .unwrap();

    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "reprocess",
        "dummy",
        &json!({"description": "reprocess records"}),
    )
    .await
    .unwrap();

    let playbook_id = resolvd::db::playbooks::create(
        &h.pool,
        &resolvd::db::playbooks::NewPlaybook {
            tenant_id: h.tenant.clone(),
            name: "tool-playbook".into(),
            version: 1,
            exception_type: "DataQualityFailure".into(),
            conditions: json!({}),
            priority: 0,
            steps: vec![resolvd::db::playbooks::NewPlaybookStep {
                name: "reprocess batch".into(),
                action_type: "call_tool".into(),
                params: json!({"tool_id": tool_id, "payload": {"batch": 9}}),
            }],
        },
    )
    .await
    .unwrap();

    let broker = Arc::new(InMemoryBroker::default());
    let publisher: Arc<dyn EventSink> = Arc::new(EventPublisher::new(h.pool.clone(), broker));
    let service = resolvd::playbooks::PlaybookExecutionService::new(
        h.pool.clone(),
        publisher,
        Some(h.engine.clone()),
    );

    service
        .start(&h.tenant, exception_id, playbook_id, ActorType::Agent, "executor")
        .await
        .unwrap();

    // call_tool is risky: an agent actor is rejected before the tool runs
    let err = service
        .complete_step(&h.tenant, exception_id, playbook_id, 1, ActorType::Agent, "executor", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("requires human approval"));

    service
        .complete_step(&h.tenant, exception_id, playbook_id, 1, ActorType::User, "alice", None)
        .await
        .unwrap();

    let events =
        resolvd::db::exception_events::list_for_exception(&h.pool, &h.tenant, exception_id)
            .await
            .unwrap();
    let step_event = events
        .iter()
        .find(|event| event.event_type == event_types::PLAYBOOK_STEP_COMPLETED)
        .unwrap();
    let tool_execution = &step_event.payload["tool_execution"];
    assert_eq!(tool_execution["tool_id"], tool_id);
    assert_eq!(tool_execution["status"], "succeeded");
    assert_eq!(tool_execution["success"], true);

    let row = resolvd::db::exceptions::get(&h.pool, &h.tenant, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.current_step, None, "single-step playbook should complete");
}

#[tokio::test]
async fn failing_call_tool_does_not_advance_step() {
    let Some(h) = harness(Duration::from_secs(60)).await else {
        return;
    };
    let exception_id = "EXC-CALLTOOL-2";
    resolvd::db::exceptions::insert_if_new(
        &h.pool,
        &resolvd::db::exceptions::NewException {
            exception_id: exception_id.into(),
            tenant_id: h.tenant.clone(),
            source_system: "billing".into(),
            exception_type: "DataQualityFailure".into(),
            severity: resolvd::db::exceptions::Severity::Medium,
            raw_payload: json!({}),
            normalized_context: json!({}),
        },
    )
    .await
    .unwrap();

    // http tool pointing at a blocked host fails pre-dispatch
    let tool_id = tool_definitions::insert(
        &h.pool,
        Some(&h.tenant),
        "blocked-step-tool",
        "http",
        &http_tool_config("http://localhost/x"),
    )
    .await
    .unwrap();

    let playbook_id = resolvd::db::playbooks::create(
        &h.pool,
        &resolvd::db::playbooks::NewPlaybook {
            tenant_id: h.tenant.clone(),
            name: "failing-tool-playbook".into(),
            version: 1,
            exception_type: "DataQualityFailure".into(),
            conditions: json!({}),
            priority: 0,
            steps: vec![resolvd::db::playbooks::NewPlaybookStep {
                name: "doomed call".into(),
                action_type: "call_tool".into(),
                params: json!({"tool_id": tool_id, "payload": {}}),
            }],
        },
    )
    .await
    .unwrap();

    let broker = Arc::new(InMemoryBroker::default());
    let publisher: Arc<dyn EventSink> = Arc::new(EventPublisher::new(h.pool.clone(), broker));
    let service = resolvd::playbooks::PlaybookExecutionService::new(
        h.pool.clone(),
        publisher,
        Some(h.engine.clone()),
    );

    service
        .start(&h.tenant, exception_id, playbook_id, ActorType::Agent, "executor")
        .await
        .unwrap();
    let err = service
        .complete_step(&h.tenant, exception_id, playbook_id, 1, ActorType::User, "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        resolvd::playbooks::PlaybookExecutionError::ToolFailed(_)
    ));

    let row = resolvd::db::exceptions::get(&h.pool, &h.tenant, exception_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.current_step, Some(1), "failed tool must not advance the step");

    let events =
        resolvd::db::exception_events::list_for_exception(&h.pool, &h.tenant, exception_id)
            .await
            .unwrap();
    assert!(
        !events
            .iter()
            .any(|event| event.event_type == event_types::PLAYBOOK_STEP_COMPLETED),
        "no step completion may be recorded for the failed attempt"
    );
    // the underlying tool failure event is the only failure trace
    assert!(events
        .iter()
        .any(|event| event.event_type == event_types::TOOL_EXECUTION_FAILED));
}
