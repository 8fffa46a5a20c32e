use serde_json::Value;
use sqlx::PgExecutor;

/// `tenant_id NULL` means the tool is global and visible to every tenant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolDefinitionRow {
    pub tool_id: i64,
    pub tenant_id: Option<String>,
    pub name: String,
    pub tool_type: String,
    pub config: Value,
}

pub async fn insert<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: Option<&str>,
    name: &str,
    tool_type: &str,
    config: &Value,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO tool_definitions (tenant_id, name, tool_type, config)
        VALUES ($1, $2, $3, $4)
        RETURNING tool_id
        "#,
    )
    .bind(tenant_id)
    .bind(name)
    .bind(tool_type)
    .bind(config)
    .fetch_one(executor)
    .await
}

/// Fetch a tool visible to the tenant: either tenant-owned or global.
pub async fn get_visible<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    tool_id: i64,
) -> Result<Option<ToolDefinitionRow>, sqlx::Error> {
    sqlx::query_as::<_, ToolDefinitionRow>(
        r#"
        SELECT tool_id, tenant_id, name, tool_type, config
        FROM tool_definitions
        WHERE tool_id = $1 AND (tenant_id IS NULL OR tenant_id = $2)
        "#,
    )
    .bind(tool_id)
    .bind(tenant_id)
    .fetch_optional(executor)
    .await
}

/// Fetch regardless of tenant; used by the scope check to distinguish
/// "missing" from "owned by another tenant".
pub async fn get_any<'c>(
    executor: impl PgExecutor<'c>,
    tool_id: i64,
) -> Result<Option<ToolDefinitionRow>, sqlx::Error> {
    sqlx::query_as::<_, ToolDefinitionRow>(
        r#"
        SELECT tool_id, tenant_id, name, tool_type, config
        FROM tool_definitions
        WHERE tool_id = $1
        "#,
    )
    .bind(tool_id)
    .fetch_optional(executor)
    .await
}
