//! Authoritative group operations.
//!
//! Every mutation runs as one transaction holding the group's exclusive row
//! lock, so concurrent mutations of the same group serialize while distinct
//! groups proceed in parallel. Cache deltas are pushed only after the
//! transaction commits, and their failures are logged and swallowed.
//!
//! Batches are not chunked internally: a single call is one transaction
//! regardless of size.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use keys::KeyFormat;
use models::{Group, GroupSettings, GroupType, MemberMetadata, NewMember, TemplateSpec};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::Cache;
use crate::resolver::TemplateResolver;
use crate::{cache_sync, subscriptions, Error, Result, ValidationError};

pub struct GroupSpec {
    pub name: String,
    pub group_type: GroupType,
    pub owner: Uuid,
    pub settings: GroupSettings,
}

/// The settings document's tag must agree with the group type.
pub fn validate_settings(
    group_type: GroupType,
    settings: &GroupSettings,
) -> std::result::Result<(), ValidationError> {
    if settings.group_type() != group_type {
        return Err(ValidationError::SettingsMismatch {
            group_type,
            settings: settings.group_type(),
        });
    }
    Ok(())
}

/// Alert-group homogeneity: every template must derive to one target alert
/// type and require the same set of non-targeting variables.
pub fn validate_alert_group(
    templates: &[TemplateSpec],
) -> std::result::Result<(), ValidationError> {
    let Some(first) = templates.first() else {
        return Ok(());
    };
    for other in &templates[1..] {
        if other.alert_type != first.alert_type {
            return Err(ValidationError::MixedAlertTypes {
                first: first.alert_type,
                second: other.alert_type,
            });
        }
        if other.required_inputs() != first.required_inputs() {
            return Err(ValidationError::MixedRequiredVariables {
                first: first.id,
                second: other.id,
            });
        }
    }
    Ok(())
}

/// Merge incoming members into the group's document. Keys already present
/// are left untouched (a no-op, not an update). Returns the inserted keys.
fn merge_members(
    member_data: &mut BTreeMap<String, MemberMetadata>,
    incoming: Vec<(String, MemberMetadata)>,
) -> Vec<String> {
    let mut inserted = Vec::new();
    for (key, meta) in incoming {
        if let std::collections::btree_map::Entry::Vacant(entry) = member_data.entry(key.clone()) {
            entry.insert(meta);
            inserted.push(key);
        }
    }
    inserted
}

pub async fn create_group(pool: &PgPool, cache: &dyn Cache, spec: GroupSpec) -> Result<Uuid> {
    validate_settings(spec.group_type, &spec.settings)?;
    let now = Utc::now();
    let group = Group {
        id: Uuid::new_v4(),
        group_type: spec.group_type,
        name: spec.name,
        owner: spec.owner,
        settings: spec.settings,
        member_data: BTreeMap::new(),
        member_count: 0,
        created_at: now,
        updated_at: now,
    };
    lookout_sql::groups::insert_group(&group, pool).await?;
    tracing::info!(group_id = %group.id, group_type = %group.group_type, "created group");

    if let Err(err) = cache_sync::sync_group_created(cache, &group).await {
        cache_sync::log_failure(group.id, "sync_group_created", err);
    }
    Ok(group.id)
}

/// Add members to a group, returning how many were actually inserted.
///
/// For alert groups the union of existing and incoming template references
/// is validated for homogeneity before anything is written: a heterogeneous
/// batch fails with a ValidationError and no partial insert.
#[tracing::instrument(skip(pool, cache, resolver, members), fields(count = members.len()))]
pub async fn add_members(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    group_id: Uuid,
    members: Vec<NewMember>,
    added_by: Uuid,
) -> Result<usize> {
    let mut txn = pool.begin().await?;
    let row = lookout_sql::groups::fetch_group_for_update(group_id, &mut txn)
        .await?
        .ok_or_else(|| Error::not_found("group", group_id))?;
    let mut group: Group = row.into();

    let format = KeyFormat::for_group(group.group_type);
    let now = Utc::now();
    let incoming: Vec<(String, MemberMetadata)> = members
        .into_iter()
        .map(|member| {
            let meta = MemberMetadata {
                added_at: now,
                added_by,
                label: member.label,
                tags: member.tags,
                metadata: member.metadata,
            };
            (keys::normalize(&member.key, format), meta)
        })
        .collect();

    if group.group_type == GroupType::Alert {
        let mut template_ids = BTreeSet::new();
        for key in group.member_data.keys() {
            template_ids.extend(keys::template_id(key));
        }
        for (key, _) in &incoming {
            let id = keys::template_id(key).ok_or_else(|| ValidationError::NotATemplateRef {
                key: key.clone(),
            })?;
            template_ids.insert(id);
        }
        let mut templates = Vec::new();
        for id in template_ids {
            let spec = resolver
                .resolve(id)
                .await
                .map_err(Error::Other)?
                .ok_or_else(|| Error::not_found("template", id))?;
            templates.push(spec);
        }
        validate_alert_group(&templates)?;
        if let GroupSettings::Alert(settings) = &group.settings {
            if let Some(first) = templates.first() {
                if first.alert_type != settings.alert_type {
                    return Err(ValidationError::AlertTypeMismatch {
                        configured: settings.alert_type,
                        derived: first.alert_type,
                    }
                    .into());
                }
            }
        }
    }

    let inserted = merge_members(&mut group.member_data, incoming);
    if inserted.is_empty() {
        return Ok(0);
    }
    group.member_count = group.member_data.len() as i32;
    lookout_sql::groups::update_members(group_id, &group.member_data, &mut txn).await?;
    txn.commit().await?;

    if let Err(err) = cache_sync::sync_members_added(cache, &group, &inserted).await {
        cache_sync::log_failure(group_id, "sync_members_added", err);
    }
    subscriptions::on_membership_changed(pool, cache, resolver, &group).await;

    Ok(inserted.len())
}

/// Remove members from a group, returning how many were actually removed.
/// Keys are accepted in raw or canonical form.
#[tracing::instrument(skip(pool, cache, resolver, member_keys), fields(count = member_keys.len()))]
pub async fn remove_members(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    group_id: Uuid,
    member_keys: &[String],
) -> Result<usize> {
    let mut txn = pool.begin().await?;
    let row = lookout_sql::groups::fetch_group_for_update(group_id, &mut txn)
        .await?
        .ok_or_else(|| Error::not_found("group", group_id))?;
    let mut group: Group = row.into();

    let format = KeyFormat::for_group(group.group_type);
    let mut removed = Vec::new();
    for raw in member_keys {
        let key = keys::normalize(raw, format);
        if group.member_data.remove(&key).is_some() {
            removed.push(key);
        }
    }
    if removed.is_empty() {
        return Ok(0);
    }
    group.member_count = group.member_data.len() as i32;
    lookout_sql::groups::update_members(group_id, &group.member_data, &mut txn).await?;
    txn.commit().await?;

    if let Err(err) = cache_sync::sync_members_removed(cache, &group, &removed).await {
        cache_sync::log_failure(group_id, "sync_members_removed", err);
    }
    subscriptions::on_membership_changed(pool, cache, resolver, &group).await;

    Ok(removed.len())
}

pub async fn get_members(
    pool: &PgPool,
    group_id: Uuid,
) -> Result<BTreeMap<String, MemberMetadata>> {
    let row = lookout_sql::groups::fetch_group(group_id, pool)
        .await?
        .ok_or_else(|| Error::not_found("group", group_id))?;
    Ok(row.member_data.0)
}

/// Metadata of one member; the key may be raw or canonical.
pub async fn get_member_metadata(
    pool: &PgPool,
    group_id: Uuid,
    member_key: &str,
) -> Result<Option<MemberMetadata>> {
    let row = lookout_sql::groups::fetch_group(group_id, pool)
        .await?
        .ok_or_else(|| Error::not_found("group", group_id))?;
    let group: Group = row.into();
    let key = keys::normalize(member_key, KeyFormat::for_group(group.group_type));
    Ok(group.member_data.get(&key).cloned())
}

/// Delete a group, cascading its subscriptions (their owned instances are
/// disabled, not deleted) and purging its cache entries.
#[tracing::instrument(skip(pool, cache))]
pub async fn delete_group(pool: &PgPool, cache: &dyn Cache, group_id: Uuid) -> Result<()> {
    let mut txn = pool.begin().await?;
    let row = lookout_sql::groups::fetch_group_for_update(group_id, &mut txn)
        .await?
        .ok_or_else(|| Error::not_found("group", group_id))?;
    let group: Group = row.into();

    let subs = lookout_sql::subscriptions::fetch_subscriptions_for_group(group_id, &mut *txn)
        .await?;
    let mut orphaned = Vec::new();
    for sub in &subs {
        let instances =
            lookout_sql::instances::fetch_instances_for_subscription(sub.id, &mut *txn).await?;
        for row in instances {
            let instance: models::AlertInstance = row.into();
            if instance.enabled || !instance.disabled_by_subscription {
                lookout_sql::instances::update_instance(
                    instance.id,
                    &instance.template_params,
                    instance.target_group_id,
                    &instance.target_keys,
                    false,
                    true,
                    &mut *txn,
                )
                .await?;
            }
            orphaned.push(instance);
        }
        lookout_sql::subscriptions::delete_subscription(sub.id, &mut txn).await?;
    }
    lookout_sql::groups::delete_group(group_id, &mut txn).await?;
    txn.commit().await?;
    tracing::info!(%group_id, subscriptions = subs.len(), "deleted group");

    for instance in &orphaned {
        if let Err(err) = crate::indexer::clear_alert(cache, instance).await {
            crate::indexer::log_failure(instance.id, "clear_alert", err);
        }
    }
    if let Err(err) = cache_sync::purge_group(cache, &group).await {
        cache_sync::log_failure(group_id, "purge_group", err);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::template;
    use models::AlertType;

    #[test]
    fn merge_skips_keys_already_present() {
        let mut member_data = BTreeMap::new();
        let meta = crate::testutil::member_meta();
        member_data.insert("ETH:mainnet:0xaaa".to_string(), meta.clone());

        let inserted = merge_members(
            &mut member_data,
            vec![
                ("ETH:mainnet:0xaaa".to_string(), meta.clone()),
                ("ETH:mainnet:0xbbb".to_string(), meta.clone()),
            ],
        );
        assert_eq!(inserted, vec!["ETH:mainnet:0xbbb".to_string()]);
        assert_eq!(member_data.len(), 2);

        // Round trip: removing the inserted key restores the original set.
        member_data.remove("ETH:mainnet:0xbbb");
        assert_eq!(member_data.len(), 1);
        assert!(member_data.contains_key("ETH:mainnet:0xaaa"));
    }

    #[test]
    fn alert_groups_must_be_homogeneous() {
        let a = template(Uuid::new_v4(), AlertType::Wallet, &["threshold"]);
        let b = template(Uuid::new_v4(), AlertType::Wallet, &["threshold"]);
        assert_eq!(validate_alert_group(&[a.clone(), b]), Ok(()));

        let mixed_type = template(Uuid::new_v4(), AlertType::Token, &["threshold"]);
        assert!(matches!(
            validate_alert_group(&[a.clone(), mixed_type]),
            Err(ValidationError::MixedAlertTypes { .. })
        ));

        let mixed_vars = template(Uuid::new_v4(), AlertType::Wallet, &["limit"]);
        assert!(matches!(
            validate_alert_group(&[a, mixed_vars]),
            Err(ValidationError::MixedRequiredVariables { .. })
        ));
    }

    #[test]
    fn settings_must_match_the_group_type() {
        let settings = GroupSettings::Wallet(Default::default());
        assert_eq!(validate_settings(GroupType::Wallet, &settings), Ok(()));
        assert_eq!(
            validate_settings(GroupType::Token, &settings),
            Err(ValidationError::SettingsMismatch {
                group_type: GroupType::Token,
                settings: GroupType::Wallet,
            })
        );
    }
}
