use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AlertType, ParamMap};

/// A concrete, user-owned alert configuration bound to specific targets.
///
/// Instances owned by a subscription (`source_subscription_id` set) are
/// created, updated and disabled by materialization, and are never deleted
/// by it. `disabled_by_subscription` records that materialization turned the
/// instance off; `disabled_by_user` records a manual disable, which
/// materialization never reverses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: Uuid,
    pub owner: Uuid,
    pub alert_type: AlertType,
    pub template_id: Uuid,
    pub template_params: ParamMap,
    pub target_group_id: Option<Uuid>,
    pub target_keys: Vec<String>,
    pub enabled: bool,
    pub disabled_by_subscription: bool,
    pub disabled_by_user: bool,
    pub source_subscription_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
