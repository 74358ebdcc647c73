use models::{AlertType, GroupType};
use uuid::Uuid;

/// Synchronous failures of store operations. Validation and not-found
/// errors leave all state unchanged. Cache failures are deliberately absent:
/// they are logged and swallowed at the call site and healed by
/// reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Error {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("settings are for {settings} groups but the group type is {group_type}")]
    SettingsMismatch {
        group_type: GroupType,
        settings: GroupType,
    },
    #[error("alert group members must be template references (got {key:?})")]
    NotATemplateRef { key: String },
    #[error("alert group templates must share one target alert type (found {first} and {second})")]
    MixedAlertTypes { first: AlertType, second: AlertType },
    #[error("templates {first} and {second} require different variable sets")]
    MixedRequiredVariables { first: Uuid, second: Uuid },
    #[error("templates target {derived} alerts but the group is configured for {configured}")]
    AlertTypeMismatch {
        configured: AlertType,
        derived: AlertType,
    },
    #[error("exactly one of target_group or target_key must be set")]
    InvalidTarget,
    #[error("a subscription may not target its own alert group")]
    SelfTarget,
    #[error("group {id} is not an alert group")]
    NotAnAlertGroup { id: Uuid },
    #[error("group {id} is an alert group and may not be a subscription target")]
    AlertGroupAsTarget { id: Uuid },
}
