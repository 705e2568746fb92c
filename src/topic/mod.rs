//! Topics a connection can subscribe to.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// A named category of change events.
///
/// `All` is the wildcard: it is stored in the subscription index under its
/// own key and expanded to every concrete topic by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Users,
    Products,
    Orders,
    ActivityLogs,
    ComponentInteractions,
    All,
}

impl Topic {
    /// Every topic backed by an entity collection (everything except `All`).
    pub const CONCRETE: [Topic; 5] = [
        Topic::Users,
        Topic::Products,
        Topic::Orders,
        Topic::ActivityLogs,
        Topic::ComponentInteractions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Users => "users",
            Topic::Products => "products",
            Topic::Orders => "orders",
            Topic::ActivityLogs => "activity_logs",
            Topic::ComponentInteractions => "component_interactions",
            Topic::All => "all",
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Topic::All)
    }

    /// Concrete topics covered by this subscription target.
    pub fn expand(self) -> Vec<Topic> {
        if self.is_wildcard() {
            Self::CONCRETE.to_vec()
        } else {
            vec![self]
        }
    }

    /// Whether a subscription set receives updates for `self`
    pub fn covered_by(self, subscriptions: &HashSet<Topic>) -> bool {
        subscriptions.contains(&self) || subscriptions.contains(&Topic::All)
    }

    /// Backing table in the data store, if any.
    pub fn table_name(&self) -> Option<&'static str> {
        match self {
            Topic::All => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(Topic::Users),
            "products" => Ok(Topic::Products),
            "orders" => Ok(Topic::Orders),
            "activity_logs" => Ok(Topic::ActivityLogs),
            "component_interactions" => Ok(Topic::ComponentInteractions),
            "all" => Ok(Topic::All),
            other => Err(HubError::InvalidTopic(other.to_string())),
        }
    }
}
