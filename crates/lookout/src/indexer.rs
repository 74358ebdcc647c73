//! The alert-target reverse index.
//!
//! For every alert instance the cache holds: the instance's resolved
//! target-key set, the target-key reverse index used for O(1) event-driven
//! triggering, the instance's target-group set, and the per-user instance
//! index. Resyncs are delta-only: the previously indexed target set is read
//! back from the cache and only its symmetric difference with the newly
//! resolved set is written.

use std::collections::BTreeSet;

use keys::KeyFormat;
use models::AlertInstance;
use uuid::Uuid;

use crate::cache::{self, Cache, CacheOp};

#[derive(Debug, Default, PartialEq)]
pub struct ResyncOutcome {
    pub added: usize,
    pub removed: usize,
}

pub fn log_failure(alert_id: Uuid, operation: &'static str, err: anyhow::Error) {
    tracing::error!(
        %alert_id,
        operation,
        error = ?err,
        "alert index sync failed; reconciliation will repair the drift",
    );
}

/// Resolve an instance's concrete target keys: its own explicit keys,
/// normalized per its alert type, or the current members of its target
/// group, which are canonical already.
pub fn resolve_targets(
    instance: &AlertInstance,
    group_members: Option<&BTreeSet<String>>,
) -> BTreeSet<String> {
    if instance.target_group_id.is_some() {
        return group_members.cloned().unwrap_or_default();
    }
    let format = KeyFormat::for_alert(instance.alert_type);
    instance
        .target_keys
        .iter()
        .map(|key| keys::normalize(key, format))
        .collect()
}

/// Bring the four index families in line with the instance's resolved
/// target set, touching only targets that changed.
#[tracing::instrument(skip(cache, instance, targets), fields(alert_id = %instance.id))]
pub async fn resync_alert(
    cache: &dyn Cache,
    instance: &AlertInstance,
    targets: &BTreeSet<String>,
) -> anyhow::Result<ResyncOutcome> {
    let targets_key = cache::alert_targets_key(instance.id);
    let previous = cache.set_members(&targets_key).await?;
    let added: Vec<String> = targets.difference(&previous).cloned().collect();
    let removed: Vec<String> = previous.difference(targets).cloned().collect();
    let alert_id = instance.id.to_string();

    let mut batch = Vec::new();
    let mut mirrors = Vec::new();

    if !added.is_empty() {
        batch.push(CacheOp::SetAdd {
            key: targets_key.clone(),
            members: added.clone(),
        });
    }
    if !removed.is_empty() {
        batch.push(CacheOp::SetRemove {
            key: targets_key.clone(),
            members: removed.clone(),
        });
    }
    for target in &added {
        let reverse = cache::target_alerts_key(target);
        batch.push(CacheOp::SetAdd {
            key: reverse.clone(),
            members: vec![alert_id.clone()],
        });
        mirrors.push(reverse);
    }
    for target in &removed {
        let reverse = cache::target_alerts_key(target);
        batch.push(CacheOp::SetRemove {
            key: reverse.clone(),
            members: vec![alert_id.clone()],
        });
        mirrors.push(reverse);
    }

    // Target-group and per-user indices.
    let groups_key = cache::alert_groups_key(instance.id);
    let desired_groups: BTreeSet<String> = instance
        .target_group_id
        .iter()
        .map(Uuid::to_string)
        .collect();
    let previous_groups = cache.set_members(&groups_key).await?;
    let group_adds: Vec<String> = desired_groups.difference(&previous_groups).cloned().collect();
    let group_removes: Vec<String> = previous_groups.difference(&desired_groups).cloned().collect();
    if !group_adds.is_empty() {
        batch.push(CacheOp::SetAdd {
            key: groups_key.clone(),
            members: group_adds,
        });
    }
    if !group_removes.is_empty() {
        batch.push(CacheOp::SetRemove {
            key: groups_key.clone(),
            members: group_removes,
        });
    }
    let user_key = cache::user_alerts_key(instance.owner);
    batch.push(CacheOp::SetAdd {
        key: user_key.clone(),
        members: vec![alert_id],
    });

    mirrors.push(targets_key);
    mirrors.push(groups_key);
    mirrors.push(user_key);

    let outcome = ResyncOutcome {
        added: added.len(),
        removed: removed.len(),
    };
    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await?;
    Ok(outcome)
}

/// Clear all four families for a deleted or disabled instance.
#[tracing::instrument(skip(cache, instance), fields(alert_id = %instance.id))]
pub async fn clear_alert(cache: &dyn Cache, instance: &AlertInstance) -> anyhow::Result<()> {
    let targets_key = cache::alert_targets_key(instance.id);
    let groups_key = cache::alert_groups_key(instance.id);
    let user_key = cache::user_alerts_key(instance.owner);
    let alert_id = instance.id.to_string();

    let previous = cache.set_members(&targets_key).await?;
    let mut batch = Vec::new();
    let mut mirrors = Vec::new();
    for target in &previous {
        let reverse = cache::target_alerts_key(target);
        batch.push(CacheOp::SetRemove {
            key: reverse.clone(),
            members: vec![alert_id.clone()],
        });
        mirrors.push(reverse);
    }
    for key in [&targets_key, &groups_key] {
        batch.push(CacheOp::Delete { key: key.clone() });
        batch.push(CacheOp::Delete {
            key: cache::json_mirror_key(key),
        });
    }
    batch.push(CacheOp::SetRemove {
        key: user_key.clone(),
        members: vec![alert_id],
    });
    mirrors.push(user_key);

    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await
}
