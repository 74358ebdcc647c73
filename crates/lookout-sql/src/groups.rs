use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use models::{Group, GroupSettings, GroupType, MemberMetadata};
use sqlx::postgres::{PgConnection, PgExecutor};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub struct GroupRow {
    pub id: Uuid,
    pub group_type: GroupType,
    pub name: String,
    pub owner: Uuid,
    pub settings: Json<GroupSettings>,
    pub member_data: Json<BTreeMap<String, MemberMetadata>>,
    pub member_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Group {
        Group {
            id: row.id,
            group_type: row.group_type,
            name: row.name,
            owner: row.owner,
            settings: row.settings.0,
            member_data: row.member_data.0,
            member_count: row.member_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn fetch_group(id: Uuid, db: impl PgExecutor<'_>) -> sqlx::Result<Option<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"select id, group_type, name, owner, settings, member_data,
              member_count, created_at, updated_at
        from groups where id = $1"#,
    )
    .bind(id)
    .fetch_optional(db)
    .await
}

/// Fetch a group under an exclusive row lock, serializing concurrent
/// mutations of the same group for the duration of the transaction.
pub async fn fetch_group_for_update(
    id: Uuid,
    txn: &mut PgConnection,
) -> sqlx::Result<Option<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"select id, group_type, name, owner, settings, member_data,
              member_count, created_at, updated_at
        from groups where id = $1
        for update"#,
    )
    .bind(id)
    .fetch_optional(txn)
    .await
}

pub async fn insert_group(group: &Group, db: impl PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query(
        r#"insert into groups (id, group_type, name, owner, settings, member_data, member_count)
        values ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(group.id)
    .bind(group.group_type)
    .bind(&group.name)
    .bind(group.owner)
    .bind(Json(&group.settings))
    .bind(Json(&group.member_data))
    .bind(group.member_count)
    .execute(db)
    .await?;
    Ok(())
}

/// Persist a group's mutated membership. The denormalized member count is
/// recomputed from the document being written.
pub async fn update_members(
    id: Uuid,
    member_data: &BTreeMap<String, MemberMetadata>,
    txn: &mut PgConnection,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"update groups
        set member_data = $2, member_count = $3, updated_at = now()
        where id = $1"#,
    )
    .bind(id)
    .bind(Json(member_data))
    .bind(member_data.len() as i32)
    .execute(txn)
    .await?;
    Ok(())
}

pub async fn delete_group(id: Uuid, txn: &mut PgConnection) -> sqlx::Result<bool> {
    let result = sqlx::query("delete from groups where id = $1")
        .bind(id)
        .execute(txn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Ids of all groups, for reconciliation scans.
pub async fn fetch_group_ids(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("select id from groups order by id")
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn fetch_groups_by_owner(
    owner: Uuid,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<GroupRow>> {
    sqlx::query_as::<_, GroupRow>(
        r#"select id, group_type, name, owner, settings, member_data,
              member_count, created_at, updated_at
        from groups where owner = $1
        order by created_at"#,
    )
    .bind(owner)
    .fetch_all(db)
    .await
}
