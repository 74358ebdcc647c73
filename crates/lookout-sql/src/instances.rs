use chrono::{DateTime, Utc};
use models::{AlertInstance, AlertType, ParamMap};
use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: Uuid,
    pub owner: Uuid,
    pub alert_type: AlertType,
    pub template_id: Uuid,
    pub template_params: Json<ParamMap>,
    pub target_group_id: Option<Uuid>,
    pub target_keys: Vec<String>,
    pub enabled: bool,
    pub disabled_by_subscription: bool,
    pub disabled_by_user: bool,
    pub source_subscription_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<InstanceRow> for AlertInstance {
    fn from(row: InstanceRow) -> AlertInstance {
        AlertInstance {
            id: row.id,
            owner: row.owner,
            alert_type: row.alert_type,
            template_id: row.template_id,
            template_params: row.template_params.0,
            target_group_id: row.target_group_id,
            target_keys: row.target_keys,
            enabled: row.enabled,
            disabled_by_subscription: row.disabled_by_subscription,
            disabled_by_user: row.disabled_by_user,
            source_subscription_id: row.source_subscription_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn fetch_instances_for_subscription(
    subscription_id: Uuid,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<InstanceRow>> {
    sqlx::query_as::<_, InstanceRow>(
        r#"select id, owner, alert_type, template_id, template_params,
              target_group_id, target_keys, enabled, disabled_by_subscription,
              disabled_by_user, source_subscription_id, created_at, updated_at
        from alert_instances
        where source_subscription_id = $1
        order by created_at"#,
    )
    .bind(subscription_id)
    .fetch_all(db)
    .await
}

pub async fn insert_instance(
    instance: &AlertInstance,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into alert_instances
            (id, owner, alert_type, template_id, template_params, target_group_id,
             target_keys, enabled, disabled_by_subscription, disabled_by_user,
             source_subscription_id)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(instance.id)
    .bind(instance.owner)
    .bind(instance.alert_type)
    .bind(instance.template_id)
    .bind(Json(&instance.template_params))
    .bind(instance.target_group_id)
    .bind(&instance.target_keys)
    .bind(instance.enabled)
    .bind(instance.disabled_by_subscription)
    .bind(instance.disabled_by_user)
    .bind(instance.source_subscription_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Write every materialization-owned field of an instance in one statement,
/// so that an instance transition is all-or-nothing. `disabled_by_user` is
/// deliberately not written here.
pub async fn update_instance(
    id: Uuid,
    template_params: &ParamMap,
    target_group_id: Option<Uuid>,
    target_keys: &[String],
    enabled: bool,
    disabled_by_subscription: bool,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"update alert_instances
        set template_params = $2,
            target_group_id = $3,
            target_keys = $4,
            enabled = $5,
            disabled_by_subscription = $6,
            updated_at = now()
        where id = $1"#,
    )
    .bind(id)
    .bind(Json(template_params))
    .bind(target_group_id)
    .bind(target_keys)
    .bind(enabled)
    .bind(disabled_by_subscription)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}
