use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;

use crate::db::{tool_definitions, tool_enablement};
use crate::db::tool_definitions::ToolDefinitionRow;

#[derive(Debug, Error)]
pub enum ToolValidationError {
    #[error("tool {0} not found")]
    NotFound(i64),
    #[error("tool {tool_id} is tenant-scoped to '{owner}' and not accessible to tenant '{tenant_id}'")]
    ScopeDenied {
        tool_id: i64,
        owner: String,
        tenant_id: String,
    },
    #[error("tool {tool_id} is disabled for tenant '{tenant_id}'")]
    Disabled { tool_id: i64, tenant_id: String },
    #[error("payload failed schema validation: {0}")]
    Payload(String),
    #[error("invalid input schema on tool {tool_id}: {message}")]
    Schema { tool_id: i64, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Pre-flight checks before a tool runs: tenant scope, enablement and
/// JSON-Schema payload validation. Redaction lives in `tools::security` and
/// is applied by every caller that logs or persists payloads.
#[derive(Debug, Clone)]
pub struct ToolValidationService {
    pool: PgPool,
}

impl ToolValidationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Scope check: the tool must be global or owned by the requesting
    /// tenant. Returns the definition so callers avoid a second load.
    pub async fn check_tenant_scope(
        &self,
        tenant_id: &str,
        tool_id: i64,
    ) -> Result<ToolDefinitionRow, ToolValidationError> {
        let Some(tool) = tool_definitions::get_any(&self.pool, tool_id).await? else {
            return Err(ToolValidationError::NotFound(tool_id));
        };
        match tool.tenant_id.as_deref() {
            None => Ok(tool),
            Some(owner) if owner == tenant_id => Ok(tool),
            Some(owner) => Err(ToolValidationError::ScopeDenied {
                tool_id,
                owner: owner.to_string(),
                tenant_id: tenant_id.to_string(),
            }),
        }
    }

    pub async fn check_tool_enabled(
        &self,
        tenant_id: &str,
        tool_id: i64,
    ) -> Result<(), ToolValidationError> {
        if tool_enablement::is_enabled(&self.pool, tenant_id, tool_id).await? {
            Ok(())
        } else {
            Err(ToolValidationError::Disabled {
                tool_id,
                tenant_id: tenant_id.to_string(),
            })
        }
    }

    /// Validate the input payload against the tool's input schema. A missing
    /// schema is a logged pass-through for definitions registered before
    /// schemas became mandatory.
    pub fn validate_payload(
        &self,
        tool: &ToolDefinitionRow,
        input_schema: Option<&Value>,
        payload: &Value,
    ) -> Result<(), ToolValidationError> {
        let Some(schema) = input_schema else {
            tracing::warn!(
                tool_id = tool.tool_id,
                tool = %tool.name,
                "tool has no input schema, skipping payload validation"
            );
            return Ok(());
        };
        let compiled = jsonschema::JSONSchema::compile(schema).map_err(|err| {
            ToolValidationError::Schema {
                tool_id: tool.tool_id,
                message: err.to_string(),
            }
        })?;
        if let Err(errors) = compiled.validate(payload) {
            let messages: Vec<String> = errors.map(|error| error.to_string()).collect();
            return Err(ToolValidationError::Payload(messages.join("; ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> ToolValidationService {
        // Payload validation is pure; the pool is never touched by it. Lazy
        // connect keeps these tests independent of a database.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        ToolValidationService::new(pool)
    }

    fn tool() -> ToolDefinitionRow {
        ToolDefinitionRow {
            tool_id: 1,
            tenant_id: None,
            name: "echo".to_string(),
            tool_type: "dummy".to_string(),
            config: json!({}),
        }
    }

    #[tokio::test]
    async fn missing_schema_passes_through() {
        let service = service();
        assert!(service
            .validate_payload(&tool(), None, &json!({"anything": true}))
            .is_ok());
    }

    #[tokio::test]
    async fn schema_violation_is_reported() {
        let service = service();
        let schema = json!({
            "type": "object",
            "required": ["service"],
            "properties": {"service": {"type": "string"}},
        });
        let err = service
            .validate_payload(&tool(), Some(&schema), &json!({"service": 42}))
            .unwrap_err();
        assert!(matches!(err, ToolValidationError::Payload(_)));
        assert!(service
            .validate_payload(&tool(), Some(&schema), &json!({"service": "billing"}))
            .is_ok());
    }
}
