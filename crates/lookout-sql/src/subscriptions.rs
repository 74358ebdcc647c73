use chrono::{DateTime, Utc};
use models::{GroupSubscription, SubscriptionSettings};
use sqlx::postgres::{PgConnection, PgExecutor};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub alert_group_id: Uuid,
    pub target_group_id: Option<Uuid>,
    pub target_key: Option<String>,
    pub owner: Uuid,
    pub settings: Json<SubscriptionSettings>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for GroupSubscription {
    fn from(row: SubscriptionRow) -> GroupSubscription {
        GroupSubscription {
            id: row.id,
            alert_group_id: row.alert_group_id,
            target_group_id: row.target_group_id,
            target_key: row.target_key,
            owner: row.owner,
            settings: row.settings.0,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn fetch_subscription(
    id: Uuid,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SubscriptionRow>> {
    sqlx::query_as::<_, SubscriptionRow>(
        r#"select id, alert_group_id, target_group_id, target_key, owner,
              settings, is_active, created_at, updated_at
        from group_subscriptions where id = $1"#,
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// All subscriptions bound to or targeting the given group, for cascades and
/// for re-materialization after the group's membership changes.
pub async fn fetch_subscriptions_for_group(
    group_id: Uuid,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<SubscriptionRow>> {
    sqlx::query_as::<_, SubscriptionRow>(
        r#"select id, alert_group_id, target_group_id, target_key, owner,
              settings, is_active, created_at, updated_at
        from group_subscriptions
        where alert_group_id = $1 or target_group_id = $1
        order by created_at"#,
    )
    .bind(group_id)
    .fetch_all(db)
    .await
}

pub async fn insert_subscription(
    sub: &GroupSubscription,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into group_subscriptions
            (id, alert_group_id, target_group_id, target_key, owner, settings, is_active)
        values ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(sub.id)
    .bind(sub.alert_group_id)
    .bind(sub.target_group_id)
    .bind(&sub.target_key)
    .bind(sub.owner)
    .bind(Json(&sub.settings))
    .bind(sub.is_active)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_subscription_active(
    id: Uuid,
    is_active: bool,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "update group_subscriptions set is_active = $2, updated_at = now() where id = $1",
    )
    .bind(id)
    .bind(is_active)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn update_subscription_target(
    id: Uuid,
    target_group_id: Option<Uuid>,
    target_key: Option<&str>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        r#"update group_subscriptions
        set target_group_id = $2, target_key = $3, updated_at = now()
        where id = $1"#,
    )
    .bind(id)
    .bind(target_group_id)
    .bind(target_key)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_subscription(id: Uuid, txn: &mut PgConnection) -> sqlx::Result<bool> {
    let result = sqlx::query("delete from group_subscriptions where id = $1")
        .bind(id)
        .execute(txn)
        .await?;
    Ok(result.rows_affected() == 1)
}
