use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;

use crate::broker::{Broker, BrokerError, EventHandler};
use crate::config;
use crate::db::{dead_letters, event_processing};
use crate::db::event_processing::LedgerDecision;
use crate::events::{CanonicalEvent, EXCEPTIONS_TOPIC};
use crate::publisher::PublishError;

pub mod intake;
pub mod playbook_executor;
pub mod policy;
pub mod resolution;
pub mod supervisor;
pub mod tool;
pub mod triage;

// key: worker-base -> subscribe,dedupe,process,persist,emit

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event emission failed: {0}")]
    Publish(#[from] PublishError),
    #[error("malformed event payload: {0}")]
    Malformed(String),
    #[error("{0}")]
    Failed(String),
}

/// One stage of the pipeline. `process` returns the follow-up events; the
/// runner persists them in the ledger transaction and publishes after
/// commit, so a crash never publishes an event that was not persisted.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn worker_name(&self) -> &'static str;

    fn wants(&self, event_type: &str) -> bool;

    async fn process(&self, event: &CanonicalEvent) -> Result<Vec<CanonicalEvent>, WorkerError>;
}

pub struct WorkerRunner {
    pool: PgPool,
    broker: Arc<dyn Broker>,
}

impl WorkerRunner {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        Self { pool, broker }
    }

    /// Subscribe a processor under its own consumer group on the pipeline
    /// topic.
    pub async fn spawn(&self, processor: Arc<dyn EventProcessor>) -> Result<(), BrokerError> {
        let pool = self.pool.clone();
        let broker = self.broker.clone();
        let group = processor.worker_name().to_string();
        let handler: EventHandler = Arc::new(move |event| {
            let pool = pool.clone();
            let broker = broker.clone();
            let processor = processor.clone();
            Box::pin(async move {
                handle_delivery(pool, broker, processor, event).await;
            })
        });
        self.broker
            .subscribe(&[EXCEPTIONS_TOPIC], &group, handler)
            .await
    }
}

async fn handle_delivery(
    pool: PgPool,
    broker: Arc<dyn Broker>,
    processor: Arc<dyn EventProcessor>,
    event: CanonicalEvent,
) {
    if !processor.wants(&event.event_type) {
        return;
    }
    let worker_name = processor.worker_name();
    let max_attempts = *config::WORKER_MAX_ATTEMPTS;

    let claimed = async {
        let mut tx = pool.begin().await?;
        let decision =
            event_processing::try_begin(&mut tx, event.event_id, worker_name, max_attempts).await?;
        match decision {
            LedgerDecision::Claimed => {
                // Hold the claim outside the transaction so the handler's own
                // writes and the completion mark can share one commit below.
                tx.commit().await?;
                Ok::<_, sqlx::Error>(LedgerDecision::Claimed)
            }
            other => {
                tx.rollback().await?;
                Ok(other)
            }
        }
    }
    .await;

    let claimed = match claimed {
        Ok(decision) => decision,
        Err(err) => {
            tracing::error!(?err, worker = worker_name, event_id = %event.event_id, "ledger claim failed");
            return;
        }
    };

    match claimed {
        LedgerDecision::Claimed => {}
        LedgerDecision::Skip | LedgerDecision::Exhausted => {
            let decision = event_processing::classify_skip(
                &pool,
                event.event_id,
                worker_name,
                max_attempts,
            )
            .await
            .unwrap_or(LedgerDecision::Skip);
            if decision == LedgerDecision::Exhausted {
                route_to_dlq(&pool, worker_name, &event, "retry attempts exhausted").await;
            } else {
                tracing::debug!(
                    worker = worker_name,
                    event_id = %event.event_id,
                    "duplicate delivery skipped"
                );
            }
            return;
        }
    }

    match processor.process(&event).await {
        Ok(emitted) => {
            let committed = async {
                let mut tx = pool.begin().await?;
                for follow_up in &emitted {
                    crate::db::exception_events::append_if_new(&mut tx, follow_up).await?;
                }
                event_processing::mark_completed(&mut tx, event.event_id, worker_name).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(())
            }
            .await;
            if let Err(err) = committed {
                tracing::error!(?err, worker = worker_name, event_id = %event.event_id, "failed to commit worker outcome");
                let _ = event_processing::mark_failed(
                    &pool,
                    event.event_id,
                    worker_name,
                    &err.to_string(),
                )
                .await;
                return;
            }
            // Offsets commit only after the ledger row is completed; the
            // in-memory transport has no offsets, publishing after commit is
            // the equivalent ordering.
            for follow_up in &emitted {
                if let Err(err) = broker
                    .publish(EXCEPTIONS_TOPIC, follow_up.partition_key(), follow_up)
                    .await
                {
                    tracing::error!(?err, event_type = %follow_up.event_type, "failed to publish follow-up event");
                }
            }
        }
        Err(err) => {
            tracing::error!(
                ?err,
                worker = worker_name,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "worker processing failed"
            );
            let attempts = event_processing::mark_failed(
                &pool,
                event.event_id,
                worker_name,
                &err.to_string(),
            )
            .await;
            match attempts {
                Ok(attempts) if attempts >= max_attempts => {
                    route_to_dlq(&pool, worker_name, &event, &err.to_string()).await;
                }
                Ok(_) => {}
                Err(ledger_err) => {
                    tracing::error!(?ledger_err, "failed to record worker failure");
                }
            }
        }
    }
}

async fn route_to_dlq(pool: &PgPool, worker_name: &str, event: &CanonicalEvent, reason: &str) {
    let payload = match serde_json::to_value(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(?err, "failed to serialize event for DLQ");
            return;
        }
    };
    if let Err(err) = dead_letters::insert(
        pool,
        event.event_id,
        &event.tenant_id,
        worker_name,
        &payload,
        reason,
    )
    .await
    {
        tracing::error!(?err, event_id = %event.event_id, "failed to insert dead letter");
    } else {
        tracing::warn!(
            worker = worker_name,
            event_id = %event.event_id,
            %reason,
            "event routed to DLQ"
        );
    }
}

/// Background reaper for abandoned `processing` ledger rows.
pub fn spawn_reaper(pool: PgPool, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let stale_before =
                        Utc::now() - chrono::Duration::seconds(*config::LEDGER_STALE_SECONDS);
                    match event_processing::reap_stale(&pool, stale_before).await {
                        Ok(0) => {}
                        Ok(count) => {
                            tracing::warn!(count, "reaped stale processing ledger rows");
                        }
                        Err(err) => {
                            tracing::error!(?err, "ledger reaper failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
