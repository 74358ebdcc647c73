use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of entity types a Group may hold members of.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "group_type")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Wallet,
    Alert,
    User,
    Network,
    Protocol,
    Token,
    Contract,
    Nft,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            GroupType::Wallet => "wallet",
            GroupType::Alert => "alert",
            GroupType::User => "user",
            GroupType::Network => "network",
            GroupType::Protocol => "protocol",
            GroupType::Token => "token",
            GroupType::Contract => "contract",
            GroupType::Nft => "nft",
        }
    }
}

impl Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type group settings. The serialized tag must agree with the group's
/// `group_type` column, which is checked when a group is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "group_type", rename_all = "lowercase")]
pub enum GroupSettings {
    Wallet(WalletSettings),
    Alert(AlertSettings),
    User(UserSettings),
    Network(NetworkSettings),
    Protocol(ProtocolSettings),
    Token(TokenSettings),
    Contract(ContractSettings),
    Nft(NftSettings),
}

impl GroupSettings {
    /// The group type this settings document is for.
    pub fn group_type(&self) -> GroupType {
        match self {
            GroupSettings::Wallet(_) => GroupType::Wallet,
            GroupSettings::Alert(_) => GroupType::Alert,
            GroupSettings::User(_) => GroupType::User,
            GroupSettings::Network(_) => GroupType::Network,
            GroupSettings::Protocol(_) => GroupType::Protocol,
            GroupSettings::Token(_) => GroupType::Token,
            GroupSettings::Contract(_) => GroupType::Contract,
            GroupSettings::Nft(_) => GroupType::Nft,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletSettings {
    /// Preferred display currency for balances of this group's wallets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_currency: Option<String>,
}

/// Settings of an alert group. Every template member of the group must
/// derive to this target alert type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    pub alert_type: super::AlertType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub notify_members: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub include_testnets: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(default)]
    pub include_forks: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_currency: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NftSettings {
    #[serde(default)]
    pub include_spam: bool,
}

/// Metadata stored alongside each canonical member key of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberMetadata {
    pub added_at: DateTime<Utc>,
    pub added_by: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Free-form bag for forward compatibility.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A member to be added to a group. Its key may be in raw or canonical form.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMember {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl NewMember {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// A named collection of typed member keys, owned by a user.
///
/// `member_data` maps canonical member keys to their metadata, and
/// `member_count` is always equal to its size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub group_type: GroupType,
    pub name: String,
    pub owner: Uuid,
    pub settings: GroupSettings,
    pub member_data: BTreeMap<String, MemberMetadata>,
    pub member_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn has_member(&self, canonical_key: &str) -> bool {
        self.member_data.contains_key(canonical_key)
    }

    pub fn member_keys(&self) -> BTreeSet<String> {
        self.member_data.keys().cloned().collect()
    }
}
