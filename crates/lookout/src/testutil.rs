//! In-memory fakes and fixtures shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use models::{
    AlertInstance, AlertSettings, AlertType, Group, GroupSettings, GroupSubscription, GroupType,
    MemberMetadata, TemplateSpec, TemplateVariable, WalletSettings,
};
use uuid::Uuid;

use crate::cache::{Cache, CacheOp};
use crate::materialize::{InstanceStore, InstanceUpdate};
use crate::resolver::TemplateResolver;

#[derive(Debug)]
enum Entry {
    Set(BTreeSet<String>),
    Blob(String),
}

/// An in-memory stand-in for the command cache, recording applied ops.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<HashMap<String, Entry>>,
    log: Mutex<Vec<CacheOp>>,
}

impl MemoryCache {
    /// Drain and return the ops applied since the last call.
    pub fn ops_log(&self) -> Vec<CacheOp> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
    async fn apply(&self, batch: Vec<CacheOp>) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        for op in &batch {
            match op {
                CacheOp::SetAdd { key, members } => {
                    let entry = state
                        .entry(key.clone())
                        .or_insert_with(|| Entry::Set(BTreeSet::new()));
                    let Entry::Set(set) = entry else {
                        anyhow::bail!("SADD against non-set key {key}");
                    };
                    set.extend(members.iter().cloned());
                }
                CacheOp::SetRemove { key, members } => {
                    if let Some(entry) = state.get_mut(key) {
                        let Entry::Set(set) = entry else {
                            anyhow::bail!("SREM against non-set key {key}");
                        };
                        for member in members {
                            set.remove(member);
                        }
                    }
                }
                CacheOp::Put { key, value } => {
                    state.insert(key.clone(), Entry::Blob(value.clone()));
                }
                CacheOp::Delete { key } => {
                    state.remove(key);
                }
            }
        }
        self.log.lock().unwrap().extend(batch);
        Ok(())
    }

    async fn set_members(&self, key: &str) -> anyhow::Result<BTreeSet<String>> {
        match self.state.lock().unwrap().get(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry::Set(set)) => Ok(set.clone()),
            Some(Entry::Blob(_)) => anyhow::bail!("SMEMBERS against non-set key {key}"),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        match self.state.lock().unwrap().get(key) {
            None => Ok(false),
            Some(Entry::Set(set)) => Ok(set.contains(member)),
            Some(Entry::Blob(_)) => anyhow::bail!("SISMEMBER against non-set key {key}"),
        }
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        match self.state.lock().unwrap().get(key) {
            None => Ok(None),
            Some(Entry::Blob(value)) => Ok(Some(value.clone())),
            Some(Entry::Set(_)) => anyhow::bail!("GET against set key {key}"),
        }
    }
}

/// A resolver over a fixed set of templates.
#[derive(Default)]
pub struct StaticResolver {
    templates: HashMap<Uuid, TemplateSpec>,
}

impl StaticResolver {
    pub fn new(templates: impl IntoIterator<Item = TemplateSpec>) -> Self {
        Self {
            templates: templates.into_iter().map(|t| (t.id, t)).collect(),
        }
    }
}

#[async_trait::async_trait]
impl TemplateResolver for StaticResolver {
    async fn resolve(&self, id: Uuid) -> anyhow::Result<Option<TemplateSpec>> {
        Ok(self.templates.get(&id).cloned())
    }
}

/// An in-memory instance store counting writes, for idempotence assertions.
#[derive(Default)]
pub struct MemInstanceStore {
    pub instances: Mutex<BTreeMap<Uuid, AlertInstance>>,
    pub groups: Mutex<HashMap<Uuid, BTreeSet<String>>>,
    writes: AtomicUsize,
}

impl MemInstanceStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn with_group(self, group: &Group) -> Self {
        self.groups
            .lock()
            .unwrap()
            .insert(group.id, group.member_keys());
        self
    }

    pub fn instance(&self, id: Uuid) -> AlertInstance {
        self.instances.lock().unwrap().get(&id).cloned().unwrap()
    }

    pub fn all_instances(&self) -> Vec<AlertInstance> {
        self.instances.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemInstanceStore {
    async fn fetch_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Vec<AlertInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.source_subscription_id == Some(subscription_id))
            .cloned()
            .collect())
    }

    async fn insert(&self, instance: &AlertInstance) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &InstanceUpdate) -> anyhow::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(&id).context("no such instance")?;
        instance.template_params = update.template_params.clone();
        instance.target_group_id = update.target_group_id;
        instance.target_keys = update.target_keys.clone();
        instance.enabled = update.enabled;
        instance.disabled_by_subscription = update.disabled_by_subscription;
        instance.updated_at = Utc::now();
        Ok(true)
    }

    async fn group_members(&self, group_id: Uuid) -> anyhow::Result<Option<BTreeSet<String>>> {
        Ok(self.groups.lock().unwrap().get(&group_id).cloned())
    }
}

pub fn member_meta() -> MemberMetadata {
    MemberMetadata {
        added_at: Utc::now(),
        added_by: Uuid::new_v4(),
        label: None,
        tags: Vec::new(),
        metadata: BTreeMap::new(),
    }
}

fn group_of(group_type: GroupType, settings: GroupSettings, raw_keys: &[&str]) -> Group {
    let format = keys::KeyFormat::for_group(group_type);
    let member_data: BTreeMap<String, MemberMetadata> = raw_keys
        .iter()
        .map(|raw| (keys::normalize(raw, format), member_meta()))
        .collect();
    Group {
        id: Uuid::new_v4(),
        group_type,
        name: format!("test {group_type} group"),
        owner: Uuid::new_v4(),
        settings,
        member_count: member_data.len() as i32,
        member_data,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn wallet_group(raw_keys: &[&str]) -> Group {
    group_of(
        GroupType::Wallet,
        GroupSettings::Wallet(WalletSettings::default()),
        raw_keys,
    )
}

pub fn alert_group(alert_type: AlertType, template_ids: &[Uuid]) -> Group {
    let refs: Vec<String> = template_ids.iter().map(|id| keys::template_ref(*id)).collect();
    let raw: Vec<&str> = refs.iter().map(String::as_str).collect();
    group_of(
        GroupType::Alert,
        GroupSettings::Alert(AlertSettings { alert_type }),
        &raw,
    )
}

/// A template whose non-targeting variables are all required, plus one
/// targeting variable named "target".
pub fn template(id: Uuid, alert_type: AlertType, required: &[&str]) -> TemplateSpec {
    let mut variables = vec![TemplateVariable {
        name: "target".to_string(),
        required: true,
        default: None,
        targeting: true,
    }];
    variables.extend(required.iter().map(|name| TemplateVariable {
        name: name.to_string(),
        required: true,
        default: None,
        targeting: false,
    }));
    TemplateSpec {
        id,
        alert_type,
        classification: "test".to_string(),
        variables,
    }
}

pub fn subscription_to_group(alert_group: &Group, target: &Group) -> GroupSubscription {
    GroupSubscription {
        id: Uuid::new_v4(),
        alert_group_id: alert_group.id,
        target_group_id: Some(target.id),
        target_key: None,
        owner: Uuid::new_v4(),
        settings: Default::default(),
        is_active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
