use std::collections::BTreeSet;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of entity an alert targets. Determines how the alert's explicit
/// target keys are canonicalized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_type")]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Wallet,
    Network,
    Protocol,
    Token,
    Contract,
    Nft,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            AlertType::Wallet => "wallet",
            AlertType::Network => "network",
            AlertType::Protocol => "protocol",
            AlertType::Token => "token",
            AlertType::Contract => "contract",
            AlertType::Nft => "nft",
        }
    }
}

impl Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One variable of a template's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Default value applied when the variable is not otherwise set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Targeting variables are filled from the subscription's target rather
    /// than from parameters, and are excluded from required-input checks.
    #[serde(default)]
    pub targeting: bool,
}

/// The resolved description of an alert template, as returned by the
/// (external) template resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub id: Uuid,
    /// Derived target alert type of the compiled template.
    pub alert_type: AlertType,
    /// UI classification, opaque to this system.
    pub classification: String,
    pub variables: Vec<TemplateVariable>,
}

impl TemplateSpec {
    /// Names of variables which must be set for an instance of this template
    /// to be enabled. Targeting variables are excluded.
    pub fn required_inputs(&self) -> BTreeSet<&str> {
        self.variables
            .iter()
            .filter(|v| v.required && !v.targeting)
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Non-targeting variables carrying a default value.
    pub fn defaults(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.variables
            .iter()
            .filter(|v| !v.targeting)
            .filter_map(|v| v.default.as_ref().map(|d| (v.name.as_str(), d)))
    }
}
