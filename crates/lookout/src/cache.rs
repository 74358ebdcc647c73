//! The fast command cache and its key scheme.
//!
//! All derived state lives under these keys, each family as a native set
//! plus a `:json` string mirror (a sorted JSON array) for clients without
//! set-enumeration support. The cache handle is constructed once at process
//! start and passed by reference; there is no ambient connection.

use std::collections::BTreeSet;

use anyhow::Context;
use models::GroupType;
use uuid::Uuid;

/// One cache mutation. Batches of ops are applied as a single pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    SetAdd { key: String, members: Vec<String> },
    SetRemove { key: String, members: Vec<String> },
    Put { key: String, value: String },
    Delete { key: String },
}

/// Seam over the command cache. The production implementation is
/// [`RedisCache`]; tests use an in-memory fake.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Apply a batch of mutations as one pipelined command sequence.
    async fn apply(&self, batch: Vec<CacheOp>) -> anyhow::Result<()>;

    /// Members of a native set; empty if the key is absent.
    async fn set_members(&self, key: &str) -> anyhow::Result<BTreeSet<String>>;

    async fn set_contains(&self, key: &str, member: &str) -> anyhow::Result<bool>;

    /// Plain get of a serialized blob (JSON mirrors).
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
}

pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parsing redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self { manager })
    }
}

#[async_trait::async_trait]
impl Cache for RedisCache {
    async fn apply(&self, batch: Vec<CacheOp>) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in &batch {
            match op {
                CacheOp::SetAdd { key, members } => {
                    pipe.sadd(key, members).ignore();
                }
                CacheOp::SetRemove { key, members } => {
                    pipe.srem(key, members).ignore();
                }
                CacheOp::Put { key, value } => {
                    pipe.set(key, value).ignore();
                }
                CacheOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .context("applying cache pipeline")?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> anyhow::Result<BTreeSet<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SMEMBERS {key}"))?;
        Ok(members.into_iter().collect())
    }

    async fn set_contains(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SISMEMBER {key}"))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("GET {key}"))
    }
}

// Key scheme. Canonical member keys may contain any character except
// whitespace, so they are embedded as-is.

pub fn group_members_key(group_id: Uuid) -> String {
    format!("group:{group_id}:members")
}

pub fn member_groups_key(member_key: &str) -> String {
    format!("member:{member_key}:groups")
}

pub fn groups_by_type_key(group_type: GroupType) -> String {
    format!("groups:type:{group_type}")
}

pub fn groups_by_owner_key(owner: Uuid) -> String {
    format!("groups:owner:{owner}")
}

pub fn group_partitions_key(group_id: Uuid) -> String {
    format!("group:{group_id}:partitions")
}

pub fn group_partition_key(group_id: Uuid, partition: &str) -> String {
    format!("group:{group_id}:partition:{partition}")
}

pub fn alert_targets_key(alert_id: Uuid) -> String {
    format!("alert:{alert_id}:targets")
}

pub fn target_alerts_key(target_key: &str) -> String {
    format!("target:{target_key}:alerts")
}

pub fn alert_groups_key(alert_id: Uuid) -> String {
    format!("alert:{alert_id}:groups")
}

pub fn user_alerts_key(owner: Uuid) -> String {
    format!("user:{owner}:alerts")
}

/// The `:json` mirror of a native set key.
pub fn json_mirror_key(key: &str) -> String {
    format!("{key}:json")
}

/// Re-serialize the JSON mirrors of the given set keys from their current
/// native sets. Mirrors of empty sets are deleted.
pub async fn refresh_json_mirrors<I>(cache: &dyn Cache, keys: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = String>,
{
    let mut batch = Vec::new();
    for key in keys {
        let members = cache.set_members(&key).await?;
        let mirror = json_mirror_key(&key);
        if members.is_empty() {
            batch.push(CacheOp::Delete { key: mirror });
        } else {
            let value = serde_json::to_string(&members).expect("string sets always serialize");
            batch.push(CacheOp::Put { key: mirror, value });
        }
    }
    cache.apply(batch).await
}
