//! Periodic store-to-cache reconciliation.
//!
//! The cache is derived state and its writes are best-effort, so a crashed
//! process or a dropped pipeline can leave it behind the store. Each pass
//! walks every group, compares the cached member set and partition index
//! against the authoritative document, and rebuilds drifted groups in place
//! via the delta-only rebuild. Healthy groups are not written at all.

use std::collections::BTreeSet;
use std::time::Duration;

use keys::KeyFormat;
use models::Group;
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::{self, Cache};
use crate::cache_sync;

/// What a single drifted group looked like before repair.
#[derive(Debug, PartialEq)]
pub struct DriftReport {
    pub group_id: Uuid,
    pub cached: usize,
    pub expected: usize,
    /// Members present in the store but missing from the cache.
    pub missing: Vec<String>,
    /// Members present in the cache but absent from the store.
    pub stale: Vec<String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct PassOutcome {
    pub groups: usize,
    pub drifted: usize,
    pub failed: usize,
}

fn expected_partitions(group: &Group) -> BTreeSet<String> {
    let format = KeyFormat::for_group(group.group_type);
    group
        .member_data
        .keys()
        .filter_map(|key| keys::network_partition(key, format))
        .collect()
}

/// Compare one group's cached footprint against its authoritative state and
/// repair it if drifted. Returns what was repaired, or None when the cache
/// was already consistent.
pub async fn reconcile_group(
    cache: &dyn Cache,
    group: &Group,
) -> anyhow::Result<Option<DriftReport>> {
    let cached = cache.set_members(&cache::group_members_key(group.id)).await?;
    let expected = group.member_keys();

    let missing: Vec<String> = expected.difference(&cached).cloned().collect();
    let stale: Vec<String> = cached.difference(&expected).cloned().collect();
    let partitions_drifted = cache
        .set_members(&cache::group_partitions_key(group.id))
        .await?
        != expected_partitions(group);

    if missing.is_empty() && stale.is_empty() && !partitions_drifted {
        return Ok(None);
    }

    tracing::warn!(
        group_id = %group.id,
        cached = cached.len(),
        expected = expected.len(),
        missing = missing.len(),
        stale = stale.len(),
        partitions_drifted,
        "cache drift detected; rebuilding group",
    );
    cache_sync::rebuild_group(cache, group).await?;

    Ok(Some(DriftReport {
        group_id: group.id,
        cached: cached.len(),
        expected: expected.len(),
        missing,
        stale,
    }))
}

/// One full reconciliation pass over every group. A failure on one group is
/// logged and does not abort the pass.
pub async fn run_pass(pool: &PgPool, cache: &dyn Cache) -> anyhow::Result<PassOutcome> {
    let group_ids = lookout_sql::groups::fetch_group_ids(pool).await?;
    let mut outcome = PassOutcome {
        groups: group_ids.len(),
        ..Default::default()
    };

    for group_id in group_ids {
        // Deleted between the listing and the fetch: purged elsewhere.
        let Some(row) = lookout_sql::groups::fetch_group(group_id, pool).await? else {
            continue;
        };
        let group: Group = row.into();
        match reconcile_group(cache, &group).await {
            Ok(None) => (),
            Ok(Some(_)) => outcome.drifted += 1,
            Err(err) => {
                outcome.failed += 1;
                tracing::error!(%group_id, error = ?err, "group reconciliation failed");
            }
        }
    }

    tracing::info!(
        groups = outcome.groups,
        drifted = outcome.drifted,
        failed = outcome.failed,
        "reconciliation pass complete",
    );
    Ok(outcome)
}

/// Run reconciliation passes forever at the given interval.
pub async fn run(pool: &PgPool, cache: &dyn Cache, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = run_pass(pool, cache).await {
            tracing::error!(error = ?err, "reconciliation pass failed");
        }
    }
}
