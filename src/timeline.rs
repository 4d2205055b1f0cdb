use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{FlagId, UserId};

/// What happened to a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "environment", rename_all = "snake_case")]
pub enum Action {
    Created,
    RevisionCreated,
    RevisionApproved,
    Rollback,
    Deleted,
    EnvironmentToggled(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Created => write!(f, "FeatureFlag created"),
            Action::RevisionCreated => write!(f, "Revision created"),
            Action::RevisionApproved => write!(f, "Revision approved"),
            Action::Rollback => write!(f, "FeatureFlag rollback"),
            Action::Deleted => write!(f, "FeatureFlag deleted"),
            Action::EnvironmentToggled(env) => {
                write!(f, "FeatureFlag environment {} toggle", env)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub user_id: UserId,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(user_id: UserId, action: Action, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id,
            action,
            timestamp,
        }
    }
}

/// All entries for one flag, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineRecord {
    pub feature_flag_id: FlagId,
    pub entries: Vec<TimelineEntry>,
}

impl TimelineRecord {
    pub fn new(feature_flag_id: FlagId) -> Self {
        Self {
            feature_flag_id,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: TimelineEntry) {
        self.entries.push(entry);
    }

    pub fn actions(&self) -> Vec<&Action> {
        self.entries.iter().map(|e| &e.action).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_labels() {
        assert_eq!(Action::Created.to_string(), "FeatureFlag created");
        assert_eq!(
            Action::EnvironmentToggled("prod".into()).to_string(),
            "FeatureFlag environment prod toggle"
        );
    }

    #[test]
    fn toggled_action_carries_environment_in_json() {
        let json = serde_json::to_value(Action::EnvironmentToggled("stg".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "environment_toggled", "environment": "stg"})
        );
        let plain = serde_json::to_value(Action::Rollback).unwrap();
        assert_eq!(plain, serde_json::json!({"kind": "rollback"}));
    }
}
