//! Mirrors authoritative group membership into the command cache.
//!
//! Four index families are maintained, each as a native set plus a JSON
//! mirror: per-group member sets, the member-key reverse index, type/owner
//! discovery indices, and per-`{NETWORK}:{subnet}` partition sets with a
//! per-group index of partition keys.
//!
//! Incremental sync runs right after a committed store mutation and pushes
//! only the delta. The full rebuild captures the previous cache footprint,
//! computes the new one, and applies exactly the symmetric difference, so
//! concurrent readers never observe a window of missing indices.

use std::collections::{BTreeMap, BTreeSet};

use keys::KeyFormat;
use models::Group;
use uuid::Uuid;

use crate::cache::{self, Cache, CacheOp};

/// Log-and-swallow handler for cache sync failures: the owning store
/// mutation has already committed and must not be failed or rolled back.
pub fn log_failure(group_id: Uuid, operation: &'static str, err: anyhow::Error) {
    tracing::error!(
        %group_id,
        operation,
        error = ?err,
        "cache sync failed; reconciliation will repair the drift",
    );
}

fn partition_of(group: &Group, member_key: &str) -> Option<String> {
    keys::network_partition(member_key, KeyFormat::for_group(group.group_type))
}

fn partition_map<'k>(
    group: &Group,
    member_keys: impl IntoIterator<Item = &'k String>,
) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in member_keys {
        if let Some(partition) = partition_of(group, key) {
            map.entry(partition).or_default().push(key.clone());
        }
    }
    map
}

// The per-group member mirror is written from the authoritative document
// rather than read back from the cache.
fn member_mirror_op(group: &Group) -> CacheOp {
    let key = cache::json_mirror_key(&cache::group_members_key(group.id));
    if group.member_data.is_empty() {
        CacheOp::Delete { key }
    } else {
        let value = serde_json::to_string(&group.member_keys())
            .expect("string sets always serialize");
        CacheOp::Put { key, value }
    }
}

/// Seed the discovery indices for a newly created group.
pub async fn sync_group_created(cache: &dyn Cache, group: &Group) -> anyhow::Result<()> {
    let type_key = cache::groups_by_type_key(group.group_type);
    let owner_key = cache::groups_by_owner_key(group.owner);
    cache
        .apply(vec![
            CacheOp::SetAdd {
                key: type_key.clone(),
                members: vec![group.id.to_string()],
            },
            CacheOp::SetAdd {
                key: owner_key.clone(),
                members: vec![group.id.to_string()],
            },
        ])
        .await?;
    cache::refresh_json_mirrors(cache, [type_key, owner_key]).await
}

/// Push the delta of an AddMembers mutation. `group` is the post-mutation
/// state and `added` the canonical keys actually inserted.
#[tracing::instrument(skip(cache, group), fields(group_id = %group.id))]
pub async fn sync_members_added(
    cache: &dyn Cache,
    group: &Group,
    added: &[String],
) -> anyhow::Result<()> {
    if added.is_empty() {
        return Ok(());
    }
    let mut batch = vec![CacheOp::SetAdd {
        key: cache::group_members_key(group.id),
        members: added.to_vec(),
    }];
    let mut mirrors = Vec::new();

    for key in added {
        let reverse = cache::member_groups_key(key);
        batch.push(CacheOp::SetAdd {
            key: reverse.clone(),
            members: vec![group.id.to_string()],
        });
        mirrors.push(reverse);
    }

    let partitions = partition_map(group, added);
    if !partitions.is_empty() {
        let index_key = cache::group_partitions_key(group.id);
        batch.push(CacheOp::SetAdd {
            key: index_key.clone(),
            members: partitions.keys().cloned().collect(),
        });
        mirrors.push(index_key);
        for (partition, members) in partitions {
            let set_key = cache::group_partition_key(group.id, &partition);
            batch.push(CacheOp::SetAdd {
                key: set_key.clone(),
                members,
            });
            mirrors.push(set_key);
        }
    }

    batch.push(member_mirror_op(group));
    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await
}

/// Push the delta of a RemoveMembers mutation. `group` is the post-mutation
/// state and `removed` the canonical keys actually removed.
#[tracing::instrument(skip(cache, group), fields(group_id = %group.id))]
pub async fn sync_members_removed(
    cache: &dyn Cache,
    group: &Group,
    removed: &[String],
) -> anyhow::Result<()> {
    if removed.is_empty() {
        return Ok(());
    }
    let mut batch = vec![CacheOp::SetRemove {
        key: cache::group_members_key(group.id),
        members: removed.to_vec(),
    }];
    let mut mirrors = Vec::new();

    for key in removed {
        let reverse = cache::member_groups_key(key);
        batch.push(CacheOp::SetRemove {
            key: reverse.clone(),
            members: vec![group.id.to_string()],
        });
        mirrors.push(reverse);
    }

    // Partitions which still have members after the removal keep their sets;
    // emptied partitions are deleted and unlinked from the partition index.
    let remaining: BTreeSet<String> = group
        .member_data
        .keys()
        .filter_map(|key| partition_of(group, key))
        .collect();
    let removed_partitions = partition_map(group, removed);
    if !removed_partitions.is_empty() {
        let index_key = cache::group_partitions_key(group.id);
        let mut emptied = Vec::new();
        for (partition, members) in removed_partitions {
            let set_key = cache::group_partition_key(group.id, &partition);
            if remaining.contains(&partition) {
                batch.push(CacheOp::SetRemove {
                    key: set_key.clone(),
                    members,
                });
                mirrors.push(set_key);
            } else {
                batch.push(CacheOp::Delete {
                    key: set_key.clone(),
                });
                batch.push(CacheOp::Delete {
                    key: cache::json_mirror_key(&set_key),
                });
                emptied.push(partition);
            }
        }
        if !emptied.is_empty() {
            batch.push(CacheOp::SetRemove {
                key: index_key.clone(),
                members: emptied,
            });
        }
        mirrors.push(index_key);
    }

    batch.push(member_mirror_op(group));
    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await
}

/// Remove every cache entry of a deleted group. `group` is its last known
/// state.
pub async fn purge_group(cache: &dyn Cache, group: &Group) -> anyhow::Result<()> {
    let members_key = cache::group_members_key(group.id);
    let index_key = cache::group_partitions_key(group.id);

    // Union the indexed partitions with those derived from the final
    // membership, in case the two had drifted.
    let mut partitions = cache.set_members(&index_key).await?;
    partitions.extend(
        group
            .member_data
            .keys()
            .filter_map(|key| partition_of(group, key)),
    );

    let mut batch = vec![
        CacheOp::Delete {
            key: members_key.clone(),
        },
        CacheOp::Delete {
            key: cache::json_mirror_key(&members_key),
        },
        CacheOp::Delete {
            key: index_key.clone(),
        },
        CacheOp::Delete {
            key: cache::json_mirror_key(&index_key),
        },
    ];
    for partition in &partitions {
        let set_key = cache::group_partition_key(group.id, partition);
        batch.push(CacheOp::Delete {
            key: cache::json_mirror_key(&set_key),
        });
        batch.push(CacheOp::Delete { key: set_key });
    }

    let mut mirrors = Vec::new();
    for key in group.member_data.keys() {
        let reverse = cache::member_groups_key(key);
        batch.push(CacheOp::SetRemove {
            key: reverse.clone(),
            members: vec![group.id.to_string()],
        });
        mirrors.push(reverse);
    }
    let type_key = cache::groups_by_type_key(group.group_type);
    let owner_key = cache::groups_by_owner_key(group.owner);
    batch.push(CacheOp::SetRemove {
        key: type_key.clone(),
        members: vec![group.id.to_string()],
    });
    batch.push(CacheOp::SetRemove {
        key: owner_key.clone(),
        members: vec![group.id.to_string()],
    });
    mirrors.push(type_key);
    mirrors.push(owner_key);

    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await
}

/// Recompute a group's entire mirrored footprint from the authoritative
/// store state, deleting exactly the symmetric difference against what the
/// cache currently holds. Used for repair and after bulk external edits.
#[tracing::instrument(skip(cache, group), fields(group_id = %group.id))]
pub async fn rebuild_group(cache: &dyn Cache, group: &Group) -> anyhow::Result<()> {
    let members_key = cache::group_members_key(group.id);
    let index_key = cache::group_partitions_key(group.id);
    let group_id = group.id.to_string();

    let previous = cache.set_members(&members_key).await?;
    let desired = group.member_keys();
    let added: Vec<String> = desired.difference(&previous).cloned().collect();
    let removed: Vec<String> = previous.difference(&desired).cloned().collect();

    let mut batch = Vec::new();
    let mut mirrors = Vec::new();

    if !added.is_empty() {
        batch.push(CacheOp::SetAdd {
            key: members_key.clone(),
            members: added,
        });
    }
    if !removed.is_empty() {
        batch.push(CacheOp::SetRemove {
            key: members_key.clone(),
            members: removed.clone(),
        });
    }

    // Reverse index: assert membership for every desired key (repairing
    // drifted entries) and retract it for keys no longer present.
    for key in &desired {
        let reverse = cache::member_groups_key(key);
        batch.push(CacheOp::SetAdd {
            key: reverse.clone(),
            members: vec![group_id.clone()],
        });
        mirrors.push(reverse);
    }
    for key in &removed {
        let reverse = cache::member_groups_key(key);
        batch.push(CacheOp::SetRemove {
            key: reverse.clone(),
            members: vec![group_id.clone()],
        });
        mirrors.push(reverse);
    }

    // Partition sets: diff each partition in the union of the previously
    // indexed partition keys and the desired ones.
    let previous_partitions = cache.set_members(&index_key).await?;
    let desired_partitions: BTreeMap<String, BTreeSet<String>> = {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for key in &desired {
            if let Some(partition) = partition_of(group, key) {
                map.entry(partition).or_default().insert(key.clone());
            }
        }
        map
    };
    let all_partitions: BTreeSet<&String> = previous_partitions
        .iter()
        .chain(desired_partitions.keys())
        .collect();

    let mut index_added = Vec::new();
    let mut index_removed = Vec::new();
    for partition in all_partitions {
        let set_key = cache::group_partition_key(group.id, partition);
        let current = cache.set_members(&set_key).await?;
        match desired_partitions.get(partition) {
            None => {
                batch.push(CacheOp::Delete {
                    key: cache::json_mirror_key(&set_key),
                });
                batch.push(CacheOp::Delete { key: set_key });
                index_removed.push(partition.clone());
            }
            Some(want) => {
                let add: Vec<String> = want.difference(&current).cloned().collect();
                let remove: Vec<String> = current.difference(want).cloned().collect();
                if !add.is_empty() {
                    batch.push(CacheOp::SetAdd {
                        key: set_key.clone(),
                        members: add,
                    });
                }
                if !remove.is_empty() {
                    batch.push(CacheOp::SetRemove {
                        key: set_key.clone(),
                        members: remove,
                    });
                }
                if !previous_partitions.contains(partition) {
                    index_added.push(partition.clone());
                }
                mirrors.push(set_key);
            }
        }
    }
    if !index_added.is_empty() {
        batch.push(CacheOp::SetAdd {
            key: index_key.clone(),
            members: index_added,
        });
    }
    if !index_removed.is_empty() {
        batch.push(CacheOp::SetRemove {
            key: index_key.clone(),
            members: index_removed,
        });
    }
    mirrors.push(index_key);

    // Discovery indices are asserted, never rebuilt wholesale: other groups
    // share them.
    let type_key = cache::groups_by_type_key(group.group_type);
    let owner_key = cache::groups_by_owner_key(group.owner);
    batch.push(CacheOp::SetAdd {
        key: type_key.clone(),
        members: vec![group_id.clone()],
    });
    batch.push(CacheOp::SetAdd {
        key: owner_key.clone(),
        members: vec![group_id],
    });
    mirrors.push(type_key);
    mirrors.push(owner_key);

    batch.push(member_mirror_op(group));
    cache.apply(batch).await?;
    cache::refresh_json_mirrors(cache, mirrors).await
}
