//! Revision state machine.
//!
//! Every transition takes a flag snapshot and returns a new snapshot together
//! with the timeline entry describing it. Nothing in here touches storage;
//! identities and timestamps are supplied by the caller.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlagError, Result};
use crate::ids::IdGenerator;
use crate::model::{
    Environment, FeatureFlag, FlagId, NewFlag, OrganizationId, Revision, RevisionId,
    RevisionStatus, RuleSpec, UserId,
};
use crate::revisions::RevisionLog;
use crate::timeline::{Action, TimelineEntry};

/// How the engine treats requests that cannot take effect.
///
/// `Strict` reports them as errors. `Lenient` lets them through: an approve of
/// a non-draft still archives the live revision and bumps the version, while a
/// rollback without a live revision or a toggle of an unknown environment
/// changes nothing but is still recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionPolicy {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    Propose {
        default_value: String,
        #[serde(default)]
        rules: Vec<RuleSpec>,
    },
    Approve {
        revision_id: RevisionId,
    },
    Rollback,
    ToggleEnvironment {
        environment: String,
    },
    Delete,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Propose { .. } => "propose",
            Transition::Approve { .. } => "approve",
            Transition::Rollback => "rollback",
            Transition::ToggleEnvironment { .. } => "toggle_environment",
            Transition::Delete => "delete",
        }
    }
}

/// Result of a transition: the snapshot to persist and the entry to append.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub flag: FeatureFlag,
    pub entry: TimelineEntry,
}

#[derive(Debug, Clone, Default)]
pub struct VersioningEngine {
    policy: TransitionPolicy,
}

impl VersioningEngine {
    pub fn new(policy: TransitionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Build a new flag whose initial revision is already Live at version 1.
    pub fn create(
        &self,
        new: &NewFlag,
        organization_id: OrganizationId,
        actor: UserId,
        now: DateTime<Utc>,
        ids: &mut dyn IdGenerator,
    ) -> Result<Outcome> {
        new.flag_type.validate(&new.default_value)?;

        let id = FlagId::generate(ids);
        let mut initial = Revision::draft(actor, &new.default_value, &new.rules, ids);
        initial.status = RevisionStatus::Live;

        let mut revisions = RevisionLog::new();
        revisions.append(initial)?;

        let flag = FeatureFlag {
            id,
            organization_id,
            user_id: actor,
            name: new.name.clone(),
            flag_type: new.flag_type,
            version: 1,
            generation: 0,
            revisions,
            environments: vec![Environment {
                name: new.environment.clone(),
                is_enabled: true,
            }],
            tags: normalize_tags(&new.tags),
            project: new.project.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        Ok(Outcome {
            flag,
            entry: TimelineEntry::new(actor, Action::Created, now),
        })
    }

    /// Apply one transition to `flag`. The input snapshot is left untouched;
    /// on error nothing needs to be written.
    pub fn apply(
        &self,
        flag: &FeatureFlag,
        actor: UserId,
        transition: &Transition,
        now: DateTime<Utc>,
        ids: &mut dyn IdGenerator,
    ) -> Result<Outcome> {
        if flag.is_deleted() {
            return Err(FlagError::FlagNotFound(flag.id));
        }

        let mut next = flag.clone();
        let action = match transition {
            Transition::Propose {
                default_value,
                rules,
            } => {
                self.propose(&mut next, actor, default_value, rules, ids)?;
                Action::RevisionCreated
            }
            Transition::Approve { revision_id } => {
                self.approve(&mut next, *revision_id)?;
                Action::RevisionApproved
            }
            Transition::Rollback => {
                self.rollback(&mut next)?;
                Action::Rollback
            }
            Transition::ToggleEnvironment { environment } => {
                self.toggle_environment(&mut next, environment)?;
                Action::EnvironmentToggled(environment.clone())
            }
            Transition::Delete => {
                next.deleted_at = Some(now);
                Action::Deleted
            }
        };

        next.revisions.check_invariants()?;

        Ok(Outcome {
            flag: next,
            entry: TimelineEntry::new(actor, action, now),
        })
    }

    /// Union `tags` into the flag's tag set. Not a revision transition, so no
    /// timeline entry is produced.
    pub fn merge_tags(&self, flag: &FeatureFlag, tags: &[String]) -> Result<FeatureFlag> {
        if flag.is_deleted() {
            return Err(FlagError::FlagNotFound(flag.id));
        }
        let mut next = flag.clone();
        next.tags.extend(normalize_tags(tags));
        Ok(next)
    }

    fn propose(
        &self,
        flag: &mut FeatureFlag,
        actor: UserId,
        default_value: &str,
        rules: &[RuleSpec],
        ids: &mut dyn IdGenerator,
    ) -> Result<()> {
        flag.flag_type.validate(default_value)?;
        let draft = Revision::draft(actor, default_value, rules, ids);
        flag.revisions.append(draft)
    }

    fn approve(&self, flag: &mut FeatureFlag, target: RevisionId) -> Result<()> {
        // One scan. Both picks are taken from the unmodified log, so the
        // predecessor recorded on the promoted revision does not depend on
        // where it sits relative to the live one.
        let mut demoted = None;
        let mut promoted = None;
        for rev in &flag.revisions {
            if rev.status == RevisionStatus::Live {
                demoted = Some(rev.clone());
            }
            if rev.id == target && rev.status == RevisionStatus::Draft {
                promoted = Some(rev.clone());
            }
        }

        if promoted.is_none() {
            if self.policy == TransitionPolicy::Strict {
                return Err(match flag.revisions.find_by_id(target) {
                    None => FlagError::RevisionNotFound(target),
                    Some(rev) => FlagError::InvalidTransition(format!(
                        "revision {} is {}, only drafts can be approved",
                        target, rev.status
                    )),
                });
            }
            debug!(flag = %flag.id, revision = %target, "approve target is not a draft; nothing promoted");
        }

        let demoted_id = demoted.as_ref().map(|rev| rev.id);
        if let Some(mut rev) = demoted {
            rev.status = RevisionStatus::Archived;
            flag.revisions.replace(rev.id, rev)?;
        }
        if let Some(mut rev) = promoted {
            rev.status = RevisionStatus::Live;
            rev.predecessor = demoted_id;
            flag.revisions.replace(rev.id, rev)?;
        }

        flag.version += 1;
        Ok(())
    }

    fn rollback(&self, flag: &mut FeatureFlag) -> Result<()> {
        // First pass: demote the live revision and take its predecessor.
        let Some(mut live) = flag.revisions.find_live().cloned() else {
            if self.policy == TransitionPolicy::Strict {
                return Err(FlagError::InvalidTransition(
                    "no live revision to roll back".to_string(),
                ));
            }
            debug!(flag = %flag.id, "rollback without a live revision");
            return Ok(());
        };
        let target = live.predecessor.take();
        live.status = RevisionStatus::Draft;
        flag.revisions.replace(live.id, live)?;

        // Second pass: the revision to resurrect is only known now.
        if let Some(target) = target {
            match flag.revisions.find_by_id(target).cloned() {
                Some(mut rev) if rev.status == RevisionStatus::Archived => {
                    rev.status = RevisionStatus::Live;
                    flag.revisions.replace(target, rev)?;
                }
                found => {
                    if self.policy == TransitionPolicy::Strict {
                        return Err(match found {
                            None => FlagError::RevisionNotFound(target),
                            Some(rev) => FlagError::InvalidTransition(format!(
                                "predecessor {} is {}, expected archived",
                                target, rev.status
                            )),
                        });
                    }
                    debug!(flag = %flag.id, revision = %target, "predecessor not archived; nothing resurrected");
                }
            }
        }

        flag.version -= 1;
        Ok(())
    }

    fn toggle_environment(&self, flag: &mut FeatureFlag, name: &str) -> Result<()> {
        match flag.environments.iter_mut().find(|e| e.name == name) {
            Some(env) => {
                env.is_enabled = !env.is_enabled;
                Ok(())
            }
            None if self.policy == TransitionPolicy::Lenient => {
                debug!(flag = %flag.id, environment = name, "toggle of unknown environment");
                Ok(())
            }
            None => Err(FlagError::EnvironmentNotFound(name.to_string())),
        }
    }
}

/// Trimmed, non-empty, deduplicated.
pub(crate) fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
