//! Materialization of a subscription into concrete alert instances.
//!
//! Per (subscription, template) pair the instance moves through the states
//! {absent, active, disabled-by-subscription}. Planning is pure: the driver
//! fetches current state through the [`InstanceStore`] seam, plans the full
//! set of transitions, and applies each one independently, so a failure for
//! one template never blocks its siblings. Re-running with unchanged inputs
//! plans nothing and writes nothing.
//!
//! The materializer targets a group as a whole. It never expands a target
//! group into per-wallet instances; the target indexer resolves membership
//! at index time, which keeps subscription count decoupled from wallet
//! fan-out.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use keys::KeyFormat;
use models::{
    AlertInstance, Group, GroupSubscription, ParamMap, SubscriptionSettings, SubscriptionTarget,
    TemplateSpec,
};
use uuid::Uuid;

use crate::cache::Cache;
use crate::indexer;
use crate::resolver::TemplateResolver;
use crate::{Error, Result};

/// Seam over instance persistence and target-group reads. The production
/// implementation is [`PgInstanceStore`].
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn fetch_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<AlertInstance>>;

    async fn insert(&self, instance: &AlertInstance) -> anyhow::Result<()>;

    /// Apply an update as a single atomic write.
    async fn update(&self, id: Uuid, update: &InstanceUpdate) -> anyhow::Result<bool>;

    /// Current canonical member keys of a group, or None if it is gone.
    async fn group_members(&self, group_id: Uuid) -> anyhow::Result<Option<BTreeSet<String>>>;
}

pub struct PgInstanceStore<'a> {
    pub pool: &'a sqlx::PgPool,
}

#[async_trait::async_trait]
impl InstanceStore for PgInstanceStore<'_> {
    async fn fetch_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<AlertInstance>> {
        let rows =
            lookout_sql::instances::fetch_instances_for_subscription(subscription_id, self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        lookout_sql::instances::insert_instance(instance, self.pool).await?;
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &InstanceUpdate) -> anyhow::Result<bool> {
        Ok(lookout_sql::instances::update_instance(
            id,
            &update.template_params,
            update.target_group_id,
            &update.target_keys,
            update.enabled,
            update.disabled_by_subscription,
            self.pool,
        )
        .await?)
    }

    async fn group_members(&self, group_id: Uuid) -> anyhow::Result<Option<BTreeSet<String>>> {
        let row = lookout_sql::groups::fetch_group(group_id, self.pool).await?;
        Ok(row.map(|row| Group::from(row).member_keys()))
    }
}

/// The materialization-owned fields of an instance, written as one
/// statement. `disabled_by_user` is never part of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub template_params: ParamMap,
    pub target_group_id: Option<Uuid>,
    pub target_keys: Vec<String>,
    pub enabled: bool,
    pub disabled_by_subscription: bool,
}

impl InstanceUpdate {
    /// Turn the instance off, leaving its parameters and target untouched.
    fn disable_of(instance: &AlertInstance) -> InstanceUpdate {
        InstanceUpdate {
            template_params: instance.template_params.clone(),
            target_group_id: instance.target_group_id,
            target_keys: instance.target_keys.clone(),
            enabled: false,
            disabled_by_subscription: true,
        }
    }

    fn matches(&self, instance: &AlertInstance) -> bool {
        self.template_params == instance.template_params
            && self.target_group_id == instance.target_group_id
            && self.target_keys == instance.target_keys
            && self.enabled == instance.enabled
            && self.disabled_by_subscription == instance.disabled_by_subscription
    }

    fn applied_to(&self, instance: &AlertInstance) -> AlertInstance {
        let mut next = instance.clone();
        next.template_params = self.template_params.clone();
        next.target_group_id = self.target_group_id;
        next.target_keys = self.target_keys.clone();
        next.enabled = self.enabled;
        next.disabled_by_subscription = self.disabled_by_subscription;
        next
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceAction {
    Create(AlertInstance),
    Update { id: Uuid, update: InstanceUpdate },
}

#[derive(Debug, Default, PartialEq)]
pub struct MaterializeOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Effective parameters of one (subscription, template) pair:
/// subscription-level defaults, overridden by the per-template override,
/// with template variable defaults filling anything still unset.
pub fn effective_params(settings: &SubscriptionSettings, template: &TemplateSpec) -> ParamMap {
    let mut params = settings.template_params.clone();
    if let Some(overrides) = settings.template_overrides.get(&template.id) {
        for (name, value) in overrides {
            params.insert(name.clone(), value.clone());
        }
    }
    for (name, default) in template.defaults() {
        params.entry(name.to_string()).or_insert_with(|| default.clone());
    }
    params
}

/// Plan the full set of instance transitions for a subscription. Pure.
pub fn plan_subscription(
    sub: &GroupSubscription,
    templates: &BTreeMap<Uuid, TemplateSpec>,
    existing: &[AlertInstance],
    now: DateTime<Utc>,
) -> Vec<InstanceAction> {
    let mut actions = Vec::new();
    let by_template: BTreeMap<Uuid, &AlertInstance> =
        existing.iter().map(|i| (i.template_id, i)).collect();

    // A subscription with an invalid targeting shape is treated as paused;
    // creation validates the shape so this only arises from external edits.
    let target = sub.target();
    if !sub.is_active || templates.is_empty() || target.is_none() {
        for instance in existing {
            if instance.enabled || !instance.disabled_by_subscription {
                actions.push(InstanceAction::Update {
                    id: instance.id,
                    update: InstanceUpdate::disable_of(instance),
                });
            }
        }
        return actions;
    }
    let target = target.expect("checked above");

    for (template_id, spec) in templates {
        let params = effective_params(&sub.settings, spec);
        let required = spec.required_inputs();
        let satisfiable = required.iter().all(|name| params.contains_key(*name));

        let (target_group_id, target_keys) = match &target {
            SubscriptionTarget::Group(group_id) => (Some(*group_id), Vec::new()),
            SubscriptionTarget::Key(key) => (
                None,
                vec![keys::normalize(key, KeyFormat::for_alert(spec.alert_type))],
            ),
        };

        match by_template.get(template_id) {
            None => {
                actions.push(InstanceAction::Create(AlertInstance {
                    id: Uuid::new_v4(),
                    owner: sub.owner,
                    alert_type: spec.alert_type,
                    template_id: *template_id,
                    template_params: params,
                    target_group_id,
                    target_keys,
                    enabled: satisfiable,
                    disabled_by_subscription: !satisfiable,
                    disabled_by_user: false,
                    source_subscription_id: Some(sub.id),
                    created_at: now,
                    updated_at: now,
                }));
            }
            Some(instance) => {
                // A manual disable is never reversed here; otherwise the
                // instance is enabled exactly when its inputs are satisfied.
                let update = InstanceUpdate {
                    template_params: params,
                    target_group_id,
                    target_keys,
                    enabled: satisfiable && !instance.disabled_by_user,
                    disabled_by_subscription: !satisfiable,
                };
                if !update.matches(instance) {
                    actions.push(InstanceAction::Update {
                        id: instance.id,
                        update,
                    });
                }
            }
        }
    }

    // Templates removed from the alert group: their instances are disabled,
    // never deleted.
    for instance in existing {
        if !templates.contains_key(&instance.template_id)
            && (instance.enabled || !instance.disabled_by_subscription)
        {
            actions.push(InstanceAction::Update {
                id: instance.id,
                update: InstanceUpdate::disable_of(instance),
            });
        }
    }
    actions
}

/// Materialize one subscription against its alert group's current template
/// membership.
#[tracing::instrument(skip_all, fields(subscription_id = %sub.id, alert_group_id = %alert_group.id))]
pub async fn materialize_subscription<S: InstanceStore>(
    store: &S,
    cache: &dyn Cache,
    resolver: &dyn TemplateResolver,
    sub: &GroupSubscription,
    alert_group: &Group,
) -> Result<MaterializeOutcome> {
    let mut templates = BTreeMap::new();
    for key in alert_group.member_data.keys() {
        let Some(template_id) = keys::template_id(key) else {
            tracing::warn!(member_key = %key, "alert group member is not a template reference; skipping");
            continue;
        };
        match resolver.resolve(template_id).await {
            Ok(Some(spec)) => {
                templates.insert(template_id, spec);
            }
            Ok(None) => {
                tracing::warn!(%template_id, "template no longer resolves; skipping");
            }
            Err(err) => {
                tracing::warn!(%template_id, error = ?err, "template resolution failed; skipping");
            }
        }
    }

    let existing = store
        .fetch_for_subscription(sub.id)
        .await
        .map_err(Error::Other)?;
    let actions = plan_subscription(sub, &templates, &existing, Utc::now());

    let mut outcome = MaterializeOutcome {
        unchanged: existing.len(),
        ..Default::default()
    };

    // Target-group membership is fetched once, for index resolution only.
    let group_members = match sub.target() {
        Some(SubscriptionTarget::Group(group_id)) => store
            .group_members(group_id)
            .await
            .map_err(Error::Other)?,
        _ => None,
    };

    let by_id: BTreeMap<Uuid, &AlertInstance> = existing.iter().map(|i| (i.id, i)).collect();
    for action in actions {
        let next = match action {
            InstanceAction::Create(instance) => match store.insert(&instance).await {
                Ok(()) => {
                    outcome.created += 1;
                    instance
                }
                Err(err) => {
                    tracing::warn!(template_id = %instance.template_id, error = ?err,
                        "failed to create alert instance; continuing with siblings");
                    outcome.failed += 1;
                    continue;
                }
            },
            InstanceAction::Update { id, update } => {
                let instance = by_id[&id];
                match store.update(id, &update).await {
                    Ok(_) => {
                        outcome.updated += 1;
                        outcome.unchanged -= 1;
                        update.applied_to(instance)
                    }
                    Err(err) => {
                        tracing::warn!(alert_id = %id, template_id = %instance.template_id,
                            error = ?err,
                            "failed to update alert instance; continuing with siblings");
                        outcome.failed += 1;
                        continue;
                    }
                }
            }
        };

        // Index maintenance is best-effort, like every cache write.
        if next.enabled {
            let targets = indexer::resolve_targets(&next, group_members.as_ref());
            if let Err(err) = indexer::resync_alert(cache, &next, &targets).await {
                indexer::log_failure(next.id, "resync_alert", err);
            }
        } else if let Err(err) = indexer::clear_alert(cache, &next).await {
            indexer::log_failure(next.id, "clear_alert", err);
        }
    }

    tracing::info!(
        created = outcome.created,
        updated = outcome.updated,
        unchanged = outcome.unchanged,
        failed = outcome.failed,
        "materialized subscription",
    );
    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{
        alert_group, subscription_to_group, template, wallet_group, MemInstanceStore, MemoryCache,
        StaticResolver,
    };
    use crate::cache;
    use models::AlertType;

    fn threshold_setup() -> (
        GroupSubscription,
        Group,
        Group,
        StaticResolver,
        Uuid,
        Uuid,
    ) {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let alerts = alert_group(AlertType::Wallet, &[t1, t2]);
        let wallets = wallet_group(&["ETH:mainnet:0xabc"]);
        let mut sub = subscription_to_group(&alerts, &wallets);
        sub.settings.template_params =
            [("threshold".to_string(), serde_json::json!(100))].into();
        let resolver = StaticResolver::new([
            template(t1, AlertType::Wallet, &["threshold"]),
            template(t2, AlertType::Wallet, &["threshold"]),
        ]);
        (sub, alerts, wallets, resolver, t1, t2)
    }

    #[tokio::test]
    async fn materializes_two_enabled_instances_targeting_the_wallet_group() {
        let (sub, alerts, wallets, resolver, ..) = threshold_setup();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        let outcome = materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MaterializeOutcome {
                created: 2,
                ..Default::default()
            }
        );

        let instances = store.all_instances();
        assert_eq!(instances.len(), 2);
        for instance in &instances {
            assert!(instance.enabled);
            assert!(!instance.disabled_by_subscription);
            assert_eq!(instance.target_group_id, Some(wallets.id));
            assert_eq!(instance.template_params["threshold"], serde_json::json!(100));
            assert_eq!(instance.source_subscription_id, Some(sub.id));
            // Group members are resolved into the reverse index.
            assert!(cache
                .set_contains(
                    &cache::target_alerts_key("ETH:mainnet:0xabc"),
                    &instance.id.to_string()
                )
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn rerunning_with_unchanged_inputs_writes_nothing() {
        let (sub, alerts, wallets, resolver, ..) = threshold_setup();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        let writes = store.writes();
        cache.ops_log();

        let outcome = materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MaterializeOutcome {
                unchanged: 2,
                ..Default::default()
            }
        );
        assert_eq!(store.writes(), writes);
        assert!(cache.ops_log().is_empty());
    }

    #[tokio::test]
    async fn removing_one_template_disables_only_its_instance() {
        let (sub, mut alerts, wallets, resolver, _t1, t2) = threshold_setup();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();

        alerts.member_data.remove(&keys::template_ref(t2));
        alerts.member_count = 1;
        let outcome = materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MaterializeOutcome {
                updated: 1,
                unchanged: 1,
                ..Default::default()
            }
        );

        for instance in store.all_instances() {
            if instance.template_id == t2 {
                assert!(!instance.enabled);
                assert!(instance.disabled_by_subscription);
                // Its reverse index entries are gone.
                assert!(!cache
                    .set_contains(
                        &cache::target_alerts_key("ETH:mainnet:0xabc"),
                        &instance.id.to_string()
                    )
                    .await
                    .unwrap());
            } else {
                assert!(instance.enabled);
                assert!(!instance.disabled_by_subscription);
            }
        }
    }

    #[tokio::test]
    async fn unset_required_variables_keep_instances_disabled_by_subscription() {
        let (mut sub, alerts, wallets, resolver, ..) = threshold_setup();
        sub.settings.template_params.clear();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        for instance in store.all_instances() {
            assert!(!instance.enabled);
            assert!(instance.disabled_by_subscription);
        }

        // Setting the variable re-enables on the next pass.
        sub.settings.template_params =
            [("threshold".to_string(), serde_json::json!(5))].into();
        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        for instance in store.all_instances() {
            assert!(instance.enabled);
            assert!(!instance.disabled_by_subscription);
            assert_eq!(instance.template_params["threshold"], serde_json::json!(5));
        }
    }

    #[tokio::test]
    async fn manual_disables_survive_every_transition() {
        let (sub, alerts, wallets, resolver, t1, _) = threshold_setup();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();

        // The user manually disables t1's instance.
        let id = store
            .all_instances()
            .into_iter()
            .find(|i| i.template_id == t1)
            .unwrap()
            .id;
        {
            let mut instances = store.instances.lock().unwrap();
            let instance = instances.get_mut(&id).unwrap();
            instance.enabled = false;
            instance.disabled_by_user = true;
        }

        let outcome = materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        assert_eq!(outcome.created, 0);
        let instance = store.instance(id);
        assert!(!instance.enabled);
        assert!(instance.disabled_by_user);
        assert!(!instance.disabled_by_subscription);
    }

    #[tokio::test]
    async fn pausing_disables_everything_and_retargeting_preserves_state() {
        let (mut sub, alerts, wallets, resolver, ..) = threshold_setup();
        let store = MemInstanceStore::default().with_group(&wallets);
        let cache = MemoryCache::default();

        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();

        sub.is_active = false;
        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        for instance in store.all_instances() {
            assert!(!instance.enabled);
            assert!(instance.disabled_by_subscription);
        }

        // Reactivate against a direct key target: instances are retargeted
        // and re-enabled (they were disabled by the subscription).
        sub.is_active = true;
        sub.target_group_id = None;
        sub.target_key = Some("eth:MainNet:0xDDD".to_string());
        materialize_subscription(&store, &cache, &resolver, &sub, &alerts)
            .await
            .unwrap();
        for instance in store.all_instances() {
            assert!(instance.enabled);
            assert_eq!(instance.target_group_id, None);
            assert_eq!(instance.target_keys, vec!["ETH:mainnet:0xddd".to_string()]);
        }
    }

    #[test]
    fn overrides_and_defaults_layer_in_order() {
        let t = Uuid::new_v4();
        let mut spec = template(t, AlertType::Wallet, &["threshold"]);
        spec.variables.push(models::TemplateVariable {
            name: "window".to_string(),
            required: false,
            default: Some(serde_json::json!("1h")),
            targeting: false,
        });
        let settings = SubscriptionSettings {
            template_params: [
                ("threshold".to_string(), serde_json::json!(1)),
                ("channel".to_string(), serde_json::json!("email")),
            ]
            .into(),
            template_overrides: [(
                t,
                [("threshold".to_string(), serde_json::json!(2))].into(),
            )]
            .into(),
        };
        let params = effective_params(&settings, &spec);
        assert_eq!(params["threshold"], serde_json::json!(2));
        assert_eq!(params["channel"], serde_json::json!("email"));
        assert_eq!(params["window"], serde_json::json!("1h"));
    }
}
