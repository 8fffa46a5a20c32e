use serde_json::Value;
use sqlx::PgExecutor;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlaybookRow {
    pub playbook_id: i64,
    pub tenant_id: String,
    pub name: String,
    pub version: i32,
    pub exception_type: String,
    pub conditions: Value,
    pub priority: i32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlaybookStepRow {
    pub step_id: i64,
    pub playbook_id: i64,
    pub step_order: i32,
    pub name: String,
    pub action_type: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct NewPlaybook {
    pub tenant_id: String,
    pub name: String,
    pub version: i32,
    pub exception_type: String,
    pub conditions: Value,
    pub priority: i32,
    pub steps: Vec<NewPlaybookStep>,
}

#[derive(Debug, Clone)]
pub struct NewPlaybookStep {
    pub name: String,
    pub action_type: String,
    pub params: Value,
}

pub async fn create(
    pool: &sqlx::PgPool,
    new: &NewPlaybook,
) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let playbook_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO playbooks (tenant_id, name, version, exception_type, conditions, priority)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING playbook_id
        "#,
    )
    .bind(&new.tenant_id)
    .bind(&new.name)
    .bind(new.version)
    .bind(&new.exception_type)
    .bind(&new.conditions)
    .bind(new.priority)
    .fetch_one(&mut tx)
    .await?;

    for (idx, step) in new.steps.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO playbook_steps (playbook_id, step_order, name, action_type, params)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(playbook_id)
        .bind((idx + 1) as i32)
        .bind(&step.name)
        .bind(&step.action_type)
        .bind(&step.params)
        .execute(&mut tx)
        .await?;
    }

    tx.commit().await?;
    Ok(playbook_id)
}

pub async fn get<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
    playbook_id: i64,
) -> Result<Option<PlaybookRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaybookRow>(
        r#"
        SELECT playbook_id, tenant_id, name, version, exception_type, conditions, priority
        FROM playbooks
        WHERE tenant_id = $1 AND playbook_id = $2
        "#,
    )
    .bind(tenant_id)
    .bind(playbook_id)
    .fetch_optional(executor)
    .await
}

pub async fn list_for_tenant<'c>(
    executor: impl PgExecutor<'c>,
    tenant_id: &str,
) -> Result<Vec<PlaybookRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaybookRow>(
        r#"
        SELECT playbook_id, tenant_id, name, version, exception_type, conditions, priority
        FROM playbooks
        WHERE tenant_id = $1
        ORDER BY playbook_id
        "#,
    )
    .bind(tenant_id)
    .fetch_all(executor)
    .await
}

pub async fn steps<'c>(
    executor: impl PgExecutor<'c>,
    playbook_id: i64,
) -> Result<Vec<PlaybookStepRow>, sqlx::Error> {
    sqlx::query_as::<_, PlaybookStepRow>(
        r#"
        SELECT step_id, playbook_id, step_order, name, action_type, params
        FROM playbook_steps
        WHERE playbook_id = $1
        ORDER BY step_order
        "#,
    )
    .bind(playbook_id)
    .fetch_all(executor)
    .await
}
