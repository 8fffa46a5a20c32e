#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use resolvd::agents::{PolicyAgent, ResolutionAgent, TriageAgent};
use resolvd::broker::{Broker, InMemoryBroker};
use resolvd::notify::NotificationService;
use resolvd::observability::{AuditLogger, TenantMetrics};
use resolvd::packs::{DomainPack, PackRegistry, TenantPolicyPack};
use resolvd::playbooks::PlaybookExecutionService;
use resolvd::publisher::{EventPublisher, EventSink};
use resolvd::safety::{IncidentManager, ViolationDetector, ViolationStore};
use resolvd::supervisor::SupervisorAgent;
use resolvd::tools::breaker::{BreakerConfig, CircuitBreakerRegistry};
use resolvd::tools::engine::ToolExecutionEngine;
use resolvd::workers::{
    intake::IntakeWorker, playbook_executor::PlaybookExecutorWorker, policy::PolicyWorker,
    resolution::ResolutionWorker, supervisor::SupervisorWorker, tool::ToolWorker,
    triage::TriageWorker, WorkerRunner,
};

/// Connects and migrates, or skips the test when DATABASE_URL is unset.
pub async fn maybe_pool() -> Option<PgPool> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: DATABASE_URL not set");
            return None;
        }
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Some(pool)
}

pub fn unique_tenant(prefix: &str) -> String {
    format!("{prefix}-{}", &Uuid::new_v4().to_string()[..8])
}

pub struct Pipeline {
    pub pool: PgPool,
    pub broker: Arc<dyn Broker>,
    pub publisher: Arc<dyn EventSink>,
    pub packs: Arc<PackRegistry>,
    pub metrics: Arc<TenantMetrics>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub violations: Arc<ViolationStore>,
    pub tool_engine: Arc<ToolExecutionEngine>,
    pub playbook_service: Arc<PlaybookExecutionService>,
}

/// Full worker wiring over an in-memory broker, mirroring the process
/// bootstrap.
pub async fn spawn_pipeline(pool: PgPool, violation_dir: &std::path::Path) -> Pipeline {
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::default());
    let publisher: Arc<dyn EventSink> = Arc::new(EventPublisher::new(pool.clone(), broker.clone()));
    let packs = Arc::new(PackRegistry::new());
    let violations = Arc::new(ViolationStore::new(violation_dir));
    let detector = Arc::new(ViolationDetector::new(violations.clone()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
    let metrics = Arc::new(TenantMetrics::new());
    let audit = Arc::new(AuditLogger::new(violation_dir.join("audit")));

    let tool_engine = Arc::new(ToolExecutionEngine::new(
        pool.clone(),
        breakers.clone(),
        publisher.clone(),
        packs.clone(),
        detector.clone(),
    ));
    let playbook_service = Arc::new(PlaybookExecutionService::new(
        pool.clone(),
        publisher.clone(),
        Some(tool_engine.clone()),
    ));

    let runner = WorkerRunner::new(pool.clone(), broker.clone());
    runner
        .spawn(Arc::new(IntakeWorker::new(pool.clone(), metrics.clone())))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(TriageWorker::new(
            pool.clone(),
            packs.clone(),
            TriageAgent::new(),
            audit.clone(),
        )))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(PolicyWorker::new(
            pool.clone(),
            packs.clone(),
            PolicyAgent::new(),
            detector.clone(),
            audit.clone(),
            Arc::new(IncidentManager::new()),
            Arc::new(NotificationService::new()),
        )))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(PlaybookExecutorWorker::new(
            pool.clone(),
            playbook_service.clone(),
            metrics.clone(),
        )))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(ToolWorker::new(
            pool.clone(),
            tool_engine.clone(),
            metrics.clone(),
        )))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(ResolutionWorker::new(
            pool.clone(),
            packs.clone(),
            ResolutionAgent::new(),
            audit.clone(),
        )))
        .await
        .unwrap();
    runner
        .spawn(Arc::new(SupervisorWorker::new(
            pool.clone(),
            SupervisorAgent::new(),
            audit.clone(),
        )))
        .await
        .unwrap();

    Pipeline {
        pool,
        broker,
        publisher,
        packs,
        metrics,
        breakers,
        violations,
        tool_engine,
        playbook_service,
    }
}

pub fn register_billing_packs(packs: &PackRegistry, tenant_id: &str, approval_threshold: f64) {
    let domain: DomainPack = serde_json::from_value(json!({
        "domain": "billing",
        "version": "1",
        "exceptionTypes": ["DataQualityFailure", "OutageDetected"],
        "severityRules": [
            {"exceptionType": "DataQualityFailure", "severity": "MEDIUM"},
        ],
        "guardrails": {
            "allowLists": [],
            "blockLists": [],
            "humanApprovalThreshold": approval_threshold,
        },
    }))
    .unwrap();
    // Same domain may already be registered by a previous test in this
    // process; that is fine.
    let _ = packs.register_domain_pack(domain);

    let tenant: TenantPolicyPack = serde_json::from_value(json!({
        "tenantId": tenant_id,
        "domainName": "billing",
    }))
    .unwrap();
    packs.register_tenant_policy(tenant).unwrap();
}
