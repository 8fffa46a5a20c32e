use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::events::CanonicalEvent;

// key: broker -> log-oriented-pubsub
//
// Abstraction over a durable log-oriented transport with consumer groups.
// The in-memory implementation keeps the broker contract the workers rely
// on: partition affinity by key, exactly one consumer per group per
// partition, serialized delivery within a partition, possible redelivery.

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("group '{0}' is already subscribed to topic '{1}'")]
    DuplicateGroup(String, String),
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub healthy: bool,
    pub topics: usize,
    pub consumer_groups: usize,
}

pub type EventHandler = Arc<dyn Fn(CanonicalEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an event. `key` drives partition affinity: all events for one
    /// key land on the same partition and are delivered in order.
    async fn publish(&self, topic: &str, key: &str, event: &CanonicalEvent)
        -> Result<(), BrokerError>;

    /// Subscribe a consumer group. Each message on a topic is delivered to
    /// exactly one consumer per group; consumers must tolerate duplicates.
    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
        handler: EventHandler,
    ) -> Result<(), BrokerError>;

    async fn health(&self) -> BrokerHealth;

    /// Stop delivery and release consumer tasks.
    async fn close(&self);
}

struct GroupState {
    senders: Vec<mpsc::UnboundedSender<CanonicalEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct TopicState {
    groups: HashMap<String, GroupState>,
}

pub struct InMemoryBroker {
    partitions: usize,
    topics: Mutex<HashMap<String, TopicState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl InMemoryBroker {
    pub fn new(partitions: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            partitions: partitions.max(1),
            topics: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.partitions
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &CanonicalEvent,
    ) -> Result<(), BrokerError> {
        if *self.shutdown_tx.borrow() {
            return Err(BrokerError::Closed);
        }
        let partition = self.partition_for(key);
        let topics = self.topics.lock().await;
        let Some(state) = topics.get(topic) else {
            // No subscribed groups: the transport drops the message. Durable
            // state lives in the event table, not here.
            tracing::debug!(%topic, %key, "publish with no consumer groups");
            return Ok(());
        };
        for (group_id, group) in &state.groups {
            if group.senders[partition].send(event.clone()).is_err() {
                tracing::warn!(%topic, group = %group_id, partition, "consumer channel closed");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
        handler: EventHandler,
    ) -> Result<(), BrokerError> {
        if *self.shutdown_tx.borrow() {
            return Err(BrokerError::Closed);
        }
        let mut registry = self.topics.lock().await;
        for topic in topics {
            let state = registry.entry((*topic).to_string()).or_default();
            if state.groups.contains_key(group_id) {
                return Err(BrokerError::DuplicateGroup(
                    group_id.to_string(),
                    (*topic).to_string(),
                ));
            }

            let mut senders = Vec::with_capacity(self.partitions);
            let mut tasks = Vec::with_capacity(self.partitions);
            for partition in 0..self.partitions {
                let (tx, mut rx) = mpsc::unbounded_channel::<CanonicalEvent>();
                senders.push(tx);
                let handler = handler.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                let group = group_id.to_string();
                let topic_name = (*topic).to_string();
                // One consumer task per (group, partition): handlers run
                // serialized within a partition, concurrent across them.
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            maybe_event = rx.recv() => {
                                match maybe_event {
                                    Some(event) => handler(event).await,
                                    None => break,
                                }
                            }
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() || *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    tracing::debug!(topic = %topic_name, %group, partition, "consumer task exiting");
                }));
            }
            state
                .groups
                .insert(group_id.to_string(), GroupState { senders, tasks });
        }
        Ok(())
    }

    async fn health(&self) -> BrokerHealth {
        let topics = self.topics.lock().await;
        let consumer_groups = topics.values().map(|state| state.groups.len()).sum();
        BrokerHealth {
            healthy: !*self.shutdown_tx.borrow(),
            topics: topics.len(),
            consumer_groups,
        }
    }

    async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        // Collect tasks with the lock released before awaiting them: an
        // in-flight handler may be publishing, which needs the same lock.
        let mut tasks = Vec::new();
        {
            let mut topics = self.topics.lock().await;
            for state in topics.values_mut() {
                for group in state.groups.values_mut() {
                    group.senders.clear();
                    tasks.append(&mut group.tasks);
                }
            }
            topics.clear();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}
