use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::broker::{Broker, BrokerError};
use crate::db::exception_events;
use crate::events::{CanonicalEvent, EXCEPTIONS_TOPIC};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Thin capability handed to services that must emit events without seeing
/// the full bus: persist first, then publish. If the publish fails the row
/// remains and the system stays consistent (callers may retry).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &CanonicalEvent) -> Result<(), PublishError>;
}

pub struct EventPublisher {
    pool: PgPool,
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    pub fn new(pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        Self { pool, broker }
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn emit(&self, event: &CanonicalEvent) -> Result<(), PublishError> {
        let inserted = exception_events::append_if_new(&self.pool, event).await?;
        if !inserted {
            tracing::debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "event already persisted, republishing"
            );
        }
        self.broker
            .publish(EXCEPTIONS_TOPIC, event.partition_key(), event)
            .await?;
        Ok(())
    }
}
