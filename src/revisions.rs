use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{FlagError, Result};
use crate::model::{Revision, RevisionId, RevisionStatus};

/// Ordered revision history of one flag.
///
/// Order is creation order and doubles as the audit history, so nothing here
/// reorders or removes entries. Only `status` and `predecessor` of an
/// existing revision may change through [`RevisionLog::replace`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionLog {
    revisions: Vec<Revision>,
}

impl RevisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The unique Live revision, if any.
    pub fn find_live(&self) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.is_live())
    }

    pub fn find_by_id(&self, id: RevisionId) -> Option<&Revision> {
        self.revisions.iter().find(|r| r.id == id)
    }

    /// Replace the revision with identity `id` in place.
    pub fn replace(&mut self, id: RevisionId, updated: Revision) -> Result<()> {
        let slot = self
            .revisions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(FlagError::RevisionNotFound(id))?;

        if updated.id != slot.id
            || updated.user_id != slot.user_id
            || updated.default_value != slot.default_value
            || updated.rules != slot.rules
        {
            return Err(FlagError::InvalidTransition(format!(
                "revision {} content is immutable",
                id
            )));
        }

        *slot = updated;
        Ok(())
    }

    pub fn append(&mut self, revision: Revision) -> Result<()> {
        if self.find_by_id(revision.id).is_some() {
            return Err(FlagError::InvalidTransition(format!(
                "revision {} already exists",
                revision.id
            )));
        }
        self.revisions.push(revision);
        Ok(())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.revisions.iter()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.revisions.iter().filter(|r| r.is_live()).count()
    }

    /// Structural invariants that must hold for every committed state:
    /// unique identities, at most one Live revision, no predecessor on a Draft.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.revisions.len());
        for rev in &self.revisions {
            if !seen.insert(rev.id) {
                return Err(FlagError::InvalidTransition(format!(
                    "duplicate revision {}",
                    rev.id
                )));
            }
            if rev.status == RevisionStatus::Draft && rev.predecessor.is_some() {
                return Err(FlagError::InvalidTransition(format!(
                    "draft revision {} carries a predecessor",
                    rev.id
                )));
            }
        }

        let live = self.live_count();
        if live > 1 {
            return Err(FlagError::InvalidTransition(format!(
                "{} live revisions",
                live
            )));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a RevisionLog {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.iter()
    }
}
