use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// key: canonical-event -> pipeline-envelope

pub const EXCEPTIONS_TOPIC: &str = "exceptions";

pub mod event_types {
    pub const EXCEPTION_RAISED: &str = "ExceptionRaised";
    pub const TRIAGE_REQUESTED: &str = "TriageRequested";
    pub const TRIAGE_COMPLETED: &str = "TriageCompleted";
    pub const POLICY_EVALUATION_REQUESTED: &str = "PolicyEvaluationRequested";
    pub const POLICY_EVALUATION_COMPLETED: &str = "PolicyEvaluationCompleted";
    pub const PLAYBOOK_MATCHED: &str = "PlaybookMatched";
    pub const PLAYBOOK_STARTED: &str = "PlaybookStarted";
    pub const PLAYBOOK_STEP_COMPLETED: &str = "PlaybookStepCompleted";
    pub const PLAYBOOK_STEP_SKIPPED: &str = "PlaybookStepSkipped";
    pub const PLAYBOOK_COMPLETED: &str = "PlaybookCompleted";
    pub const TOOL_EXECUTION_REQUESTED: &str = "ToolExecutionRequested";
    pub const TOOL_EXECUTION_COMPLETED: &str = "ToolExecutionCompleted";
    pub const TOOL_EXECUTION_FAILED: &str = "ToolExecutionFailed";
    pub const ESCALATED: &str = "Escalated";
    pub const RESOLVED: &str = "Resolved";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    User,
    Agent,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Agent => "agent",
            ActorType::System => "system",
        }
    }
}

/// Immutable envelope carried on every topic. `correlation_id` equals the
/// exception id for the pipeline so downstream joins can rebuild timelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_id: Option<String>,
    pub correlation_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn new(
        event_type: &str,
        tenant_id: &str,
        exception_id: &str,
        actor_type: ActorType,
        actor_id: &str,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            tenant_id: tenant_id.to_string(),
            exception_id: Some(exception_id.to_string()),
            correlation_id: exception_id.to_string(),
            actor_type,
            actor_id: actor_id.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Partition key for the broker: all events of one exception share a
    /// partition, which keeps the per-exception pipeline sequential.
    pub fn partition_key(&self) -> &str {
        self.exception_id.as_deref().unwrap_or(&self.correlation_id)
    }
}
