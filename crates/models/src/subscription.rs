use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ParamMap;

/// Subscription-level parameter defaults and per-template overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Defaults applied to every template of the alert group.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_params: ParamMap,
    /// Per-template parameter overrides, keyed by template id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_overrides: BTreeMap<Uuid, ParamMap>,
}

/// The single concrete target of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionTarget {
    Group(Uuid),
    Key(String),
}

/// A binding from an alert group to one concrete target, driving
/// materialization of per-template alert instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSubscription {
    pub id: Uuid,
    pub alert_group_id: Uuid,
    pub target_group_id: Option<Uuid>,
    pub target_key: Option<String>,
    pub owner: Uuid,
    pub settings: SubscriptionSettings,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupSubscription {
    /// The subscription's target, or None if the targeting shape is invalid
    /// (both or neither of target_group_id / target_key set).
    pub fn target(&self) -> Option<SubscriptionTarget> {
        match (self.target_group_id, &self.target_key) {
            (Some(group), None) => Some(SubscriptionTarget::Group(group)),
            (None, Some(key)) => Some(SubscriptionTarget::Key(key.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subscription(target_group_id: Option<Uuid>, target_key: Option<String>) -> GroupSubscription {
        GroupSubscription {
            id: Uuid::new_v4(),
            alert_group_id: Uuid::new_v4(),
            target_group_id,
            target_key,
            owner: Uuid::new_v4(),
            settings: SubscriptionSettings::default(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn target_requires_exactly_one_of_group_or_key() {
        let group = Uuid::new_v4();
        assert_eq!(
            subscription(Some(group), None).target(),
            Some(SubscriptionTarget::Group(group))
        );
        assert_eq!(
            subscription(None, Some("ETH:mainnet:0xabc".to_string())).target(),
            Some(SubscriptionTarget::Key("ETH:mainnet:0xabc".to_string()))
        );
        assert_eq!(subscription(None, None).target(), None);
        assert_eq!(
            subscription(Some(group), Some("ETH:mainnet:0xabc".to_string())).target(),
            None
        );
    }
}
