use sqlx::PgExecutor;

/// Absence of a row means the tool is enabled for the tenant.
pub async fn is_enabled<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    tool_id: i64,
) -> Result<bool, sqlx::Error> {
    let row: Option<bool> = sqlx::query_scalar(
        r#"
        SELECT enabled FROM tool_enablement
        WHERE tenant_id = $1 AND tool_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(tool_id)
    .fetch_optional(executor)
    .await?;
    Ok(row.unwrap_or(true))
}

pub async fn set_enabled<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    tool_id: i64,
    enabled: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO tool_enablement (tenant_id, tool_id, enabled)
        VALUES ($1, $2, $3)
        ON CONFLICT (tenant_id, tool_id) DO UPDATE SET enabled = EXCLUDED.enabled
        "#,
    )
    .bind(tenant_id)
    .bind(tool_id)
    .bind(enabled)
    .execute(executor)
    .await?;
    Ok(())
}
