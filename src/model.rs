use core::fmt;
use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::ids::{FlagId, OrganizationId, RevisionId, RuleId, UserId};
use crate::error::{FlagError, Result};
use crate::ids::IdGenerator;
use crate::revisions::RevisionLog;

/// Value type of a flag. Revision default values are stored as strings and
/// interpreted according to this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
}

impl FlagType {
    /// Check that `value` is a valid string encoding for this type.
    pub fn validate(&self, value: &str) -> Result<()> {
        let ok = match self {
            FlagType::Boolean => matches!(value, "true" | "false"),
            FlagType::String => true,
            FlagType::Number => value.trim().parse::<f64>().is_ok_and(f64::is_finite),
            FlagType::Json => serde_json::from_str::<serde_json::Value>(value).is_ok(),
        };
        if ok {
            Ok(())
        } else {
            Err(FlagError::InvalidValue {
                flag_type: self.to_string(),
                value: value.to_string(),
            })
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagType::Boolean => write!(f, "boolean"),
            FlagType::String => write!(f, "string"),
            FlagType::Number => write!(f, "number"),
            FlagType::Json => write!(f, "json"),
        }
    }
}

impl FromStr for FlagType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "boolean" | "bool" => Ok(FlagType::Boolean),
            "string" => Ok(FlagType::String),
            "number" => Ok(FlagType::Number),
            "json" => Ok(FlagType::Json),
            other => Err(format!("unknown flag type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionStatus {
    Draft,
    Live,
    Archived,
}

impl fmt::Display for RevisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionStatus::Draft => write!(f, "draft"),
            RevisionStatus::Live => write!(f, "live"),
            RevisionStatus::Archived => write!(f, "archived"),
        }
    }
}

/// A targeting rule. Predicate and value are opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub predicate: String,
    pub value: String,
    pub env: String,
    pub is_enabled: bool,
}

/// Rule content as supplied by a caller, before it gets an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub predicate: String,
    pub value: String,
    pub env: String,
    #[serde(default)]
    pub is_enabled: bool,
}

impl RuleSpec {
    pub fn new(predicate: &str, value: &str, env: &str, is_enabled: bool) -> Self {
        Self {
            predicate: predicate.to_string(),
            value: value.to_string(),
            env: env.to_string(),
            is_enabled,
        }
    }

    /// Materialize with a fresh identity.
    pub fn to_rule(&self, ids: &mut dyn IdGenerator) -> Rule {
        Rule {
            id: RuleId::generate(ids),
            predicate: self.predicate.clone(),
            value: self.value.clone(),
            env: self.env.clone(),
            is_enabled: self.is_enabled,
        }
    }
}

impl From<&Rule> for RuleSpec {
    fn from(rule: &Rule) -> Self {
        Self {
            predicate: rule.predicate.clone(),
            value: rule.value.clone(),
            env: rule.env.clone(),
            is_enabled: rule.is_enabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub user_id: UserId,
    pub status: RevisionStatus,
    pub default_value: String,
    /// The revision that was Live right before this one was promoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<RevisionId>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Revision {
    /// A new Draft with its own copies of `rules`.
    pub fn draft(
        user_id: UserId,
        default_value: &str,
        rules: &[RuleSpec],
        ids: &mut dyn IdGenerator,
    ) -> Self {
        Self {
            id: RevisionId::generate(ids),
            user_id,
            status: RevisionStatus::Draft,
            default_value: default_value.to_string(),
            predecessor: None,
            rules: rules.iter().map(|r| r.to_rule(ids)).collect(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == RevisionStatus::Live
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub is_enabled: bool,
}

/// Input for creating a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFlag {
    pub name: String,
    pub flag_type: FlagType,
    pub default_value: String,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    pub environment: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The flag aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub id: FlagId,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub name: String,
    pub flag_type: FlagType,
    /// Net count of live promotions. Rollback decrements it.
    pub version: i64,
    /// Write counter used as the compare-and-swap token. Only the stores
    /// advance it.
    #[serde(default)]
    pub generation: u64,
    pub revisions: RevisionLog,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FeatureFlag {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn live_revision(&self) -> Option<&Revision> {
        self.revisions.find_live()
    }

    pub fn environment(&self, name: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.name == name)
    }
}
