//! Subscription lifecycle: creation, pausing, retargeting and deletion,
//! plus the triggers that re-run materialization when a subscription or its
//! alert group's membership changes.

use chrono::Utc;
use keys::KeyFormat;
use models::{Group, GroupSettings, GroupSubscription, GroupType, SubscriptionSettings};
use sqlx::PgPool;
use uuid::Uuid;

use crate::cache::Cache;
use crate::materialize::{self, MaterializeOutcome, PgInstanceStore};
use crate::resolver::TemplateResolver;
use crate::{indexer, Error, Result, ValidationError};

pub struct SubscriptionSpec {
    pub alert_group_id: Uuid,
    pub target_group_id: Option<Uuid>,
    pub target_key: Option<String>,
    pub owner: Uuid,
    pub settings: SubscriptionSettings,
}

fn validate_target_shape(
    alert_group_id: Uuid,
    target_group_id: Option<Uuid>,
    target_key: &Option<String>,
) -> std::result::Result<(), ValidationError> {
    match (target_group_id, target_key) {
        (Some(_), Some(_)) | (None, None) => Err(ValidationError::InvalidTarget),
        (Some(group_id), None) if group_id == alert_group_id => {
            Err(ValidationError::SelfTarget)
        }
        _ => Ok(()),
    }
}

async fn fetch_alert_group(pool: &PgPool, alert_group_id: Uuid) -> Result<Group> {
    let group: Group = lookout_sql::groups::fetch_group(alert_group_id, pool)
        .await?
        .ok_or_else(|| Error::not_found("group", alert_group_id))?
        .into();
    if group.group_type != GroupType::Alert {
        return Err(ValidationError::NotAnAlertGroup { id: group.id }.into());
    }
    Ok(group)
}

/// Validate a target group: it must exist and not itself be an alert group.
async fn check_target_group(pool: &PgPool, target_group_id: Uuid) -> Result<()> {
    let row = lookout_sql::groups::fetch_group(target_group_id, pool)
        .await?
        .ok_or_else(|| Error::not_found("group", target_group_id))?;
    if row.group_type == GroupType::Alert {
        return Err(ValidationError::AlertGroupAsTarget {
            id: target_group_id,
        }
        .into());
    }
    Ok(())
}

/// Create a subscription and materialize its instances.
pub async fn create_subscription(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    spec: SubscriptionSpec,
) -> Result<Uuid> {
    validate_target_shape(spec.alert_group_id, spec.target_group_id, &spec.target_key)?;
    let alert_group = fetch_alert_group(pool, spec.alert_group_id).await?;

    let target_key = match spec.target_key {
        Some(raw) => {
            let GroupSettings::Alert(settings) = &alert_group.settings else {
                return Err(ValidationError::NotAnAlertGroup { id: alert_group.id }.into());
            };
            Some(keys::normalize(&raw, KeyFormat::for_alert(settings.alert_type)))
        }
        None => None,
    };
    if let Some(target_group_id) = spec.target_group_id {
        check_target_group(pool, target_group_id).await?;
    }

    let now = Utc::now();
    let sub = GroupSubscription {
        id: Uuid::new_v4(),
        alert_group_id: spec.alert_group_id,
        target_group_id: spec.target_group_id,
        target_key,
        owner: spec.owner,
        settings: spec.settings,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    lookout_sql::subscriptions::insert_subscription(&sub, pool).await?;
    tracing::info!(subscription_id = %sub.id, alert_group_id = %sub.alert_group_id,
        "created subscription");

    let store = PgInstanceStore { pool };
    materialize::materialize_subscription(&store, cache, resolver, &sub, &alert_group).await?;
    Ok(sub.id)
}

/// Pause or resume a subscription, then re-materialize.
pub async fn set_subscription_active(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    subscription_id: Uuid,
    is_active: bool,
) -> Result<MaterializeOutcome> {
    if !lookout_sql::subscriptions::set_subscription_active(subscription_id, is_active, pool)
        .await?
    {
        return Err(Error::not_found("subscription", subscription_id));
    }
    materialize(pool, cache, resolver, subscription_id).await
}

/// Point a subscription at a different target, then re-materialize. The
/// enabled/disabled state of its instances is preserved by the planner.
pub async fn update_subscription_target(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    subscription_id: Uuid,
    target_group_id: Option<Uuid>,
    target_key: Option<String>,
) -> Result<MaterializeOutcome> {
    let sub: GroupSubscription =
        lookout_sql::subscriptions::fetch_subscription(subscription_id, pool)
            .await?
            .ok_or_else(|| Error::not_found("subscription", subscription_id))?
            .into();
    validate_target_shape(sub.alert_group_id, target_group_id, &target_key)?;
    let alert_group = fetch_alert_group(pool, sub.alert_group_id).await?;

    let target_key = match target_key {
        Some(raw) => {
            let GroupSettings::Alert(settings) = &alert_group.settings else {
                return Err(ValidationError::NotAnAlertGroup { id: alert_group.id }.into());
            };
            Some(keys::normalize(&raw, KeyFormat::for_alert(settings.alert_type)))
        }
        None => None,
    };
    if let Some(target_group_id) = target_group_id {
        check_target_group(pool, target_group_id).await?;
    }

    lookout_sql::subscriptions::update_subscription_target(
        subscription_id,
        target_group_id,
        target_key.as_deref(),
        pool,
    )
    .await?;
    materialize(pool, cache, resolver, subscription_id).await
}

/// Fully remove a binding. Owned instances are disabled first and survive
/// the deletion with their back-reference severed.
pub async fn delete_subscription(
    pool: &PgPool,
    cache: &dyn Cache,
    subscription_id: Uuid,
) -> Result<()> {
    let mut txn = pool.begin().await?;
    let instances =
        lookout_sql::instances::fetch_instances_for_subscription(subscription_id, &mut *txn)
            .await?;
    let mut orphaned = Vec::new();
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
    if !lookout_sql::subscriptions::delete_subscription(subscription_id, &mut txn).await? {
        return Err(Error::not_found("subscription", subscription_id));
    }
    txn.commit().await?;
    tracing::info!(%subscription_id, instances = orphaned.len(), "deleted subscription");

    for instance in &orphaned {
        if let Err(err) = indexer::clear_alert(cache, instance).await {
            indexer::log_failure(instance.id, "clear_alert", err);
        }
    }
    Ok(())
}

/// Materialize one subscription by id.
pub async fn materialize(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    subscription_id: Uuid,
) -> Result<MaterializeOutcome> {
    let sub: GroupSubscription =
        lookout_sql::subscriptions::fetch_subscription(subscription_id, pool)
            .await?
            .ok_or_else(|| Error::not_found("subscription", subscription_id))?
            .into();
    let alert_group = fetch_alert_group(pool, sub.alert_group_id).await?;
    let store = PgInstanceStore { pool };
    materialize::materialize_subscription(&store, cache, resolver, &sub, &alert_group).await
}

/// React to a committed membership change of `group`.
///
/// An alert group's change re-materializes every subscription bound to it.
/// A target group's change re-resolves the target index of instances owned
/// by subscriptions targeting it. Failures are logged per subscription and
/// never propagate: the store mutation already committed.
pub async fn on_membership_changed(
    pool: &PgPool,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    group: &Group,
) {
    let subs = match lookout_sql::subscriptions::fetch_subscriptions_for_group(group.id, pool)
        .await
    {
        Ok(subs) => subs,
        Err(err) => {
            tracing::error!(group_id = %group.id, error = ?err,
                "failed to list subscriptions after membership change");
            return;
        }
    };

    let members = group.member_keys();
    for row in subs {
        let sub: GroupSubscription = row.into();
        if sub.alert_group_id == group.id {
            if let Err(err) = materialize(pool, cache, resolver, sub.id).await {
                tracing::error!(subscription_id = %sub.id, error = ?err,
                    "re-materialization after alert group change failed");
            }
        } else if sub.target_group_id == Some(group.id) {
            // Only the target index needs refreshing: membership changed,
            // not the subscription's shape or parameters.
            let instances = match lookout_sql::instances::fetch_instances_for_subscription(
                sub.id, pool,
            )
            .await
            {
                Ok(instances) => instances,
                Err(err) => {
                    tracing::error!(subscription_id = %sub.id, error = ?err,
                        "failed to list instances after target group change");
                    continue;
                }
            };
            for row in instances {
                let instance: models::AlertInstance = row.into();
                if !instance.enabled {
                    continue;
                }
                let targets = indexer::resolve_targets(&instance, Some(&members));
                if let Err(err) = indexer::resync_alert(cache, &instance, &targets).await {
                    indexer::log_failure(instance.id, "resync_alert", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn target_shape_is_exactly_one_of_group_or_key() {
        let alert_group = Uuid::new_v4();
        let target = Uuid::new_v4();
        assert_eq!(
            validate_target_shape(alert_group, Some(target), &None),
            Ok(())
        );
        assert_eq!(
            validate_target_shape(alert_group, None, &Some("ETH:mainnet:0xabc".into())),
            Ok(())
        );
        assert_eq!(
            validate_target_shape(alert_group, None, &None),
            Err(ValidationError::InvalidTarget)
        );
        assert_eq!(
            validate_target_shape(
                alert_group,
                Some(target),
                &Some("ETH:mainnet:0xabc".into())
            ),
            Err(ValidationError::InvalidTarget)
        );
        assert_eq!(
            validate_target_shape(alert_group, Some(alert_group), &None),
            Err(ValidationError::SelfTarget)
        );
    }
}
