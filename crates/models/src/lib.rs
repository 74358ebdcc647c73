mod group;
mod instance;
mod subscription;
mod template;

pub use group::{
    AlertSettings, ContractSettings, Group, GroupSettings, GroupType, MemberMetadata, NewMember,
    NetworkSettings, NftSettings, ProtocolSettings, TokenSettings, UserSettings, WalletSettings,
};
pub use instance::AlertInstance;
pub use subscription::{GroupSubscription, SubscriptionSettings, SubscriptionTarget};
pub use template::{AlertType, TemplateSpec, TemplateVariable};

/// Free-form parameter maps attached to templates, subscriptions and
/// instances. Keys are variable names.
pub type ParamMap = std::collections::BTreeMap<String, serde_json::Value>;
