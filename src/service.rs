use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::engine::{normalize_tags, Transition, TransitionPolicy, VersioningEngine};
use crate::error::{FlagError, Result};
use crate::ids::{IdGenerator, RandomIds};
use crate::model::{FeatureFlag, FlagId, NewFlag, OrganizationId, RevisionId, RuleSpec, UserId};
use crate::store::{FlagPage, FlagStore, Page, Visibility};
use crate::timeline::TimelineRecord;

/// Who is acting. Authorization has already been decided by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
}

impl Caller {
    pub fn new(user_id: UserId, organization_id: OrganizationId) -> Self {
        Self {
            user_id,
            organization_id,
        }
    }
}

/// Runs load -> transition -> commit against a [`FlagStore`].
///
/// Writes are compare-and-swap on the generation the snapshot was loaded at.
/// A [`FlagError::Conflict`] is handed back to the caller; nothing is retried.
pub struct FlagService<S> {
    store: Arc<S>,
    engine: VersioningEngine,
    clock: Arc<dyn Clock>,
    ids: Mutex<Box<dyn IdGenerator>>,
}

impl<S: FlagStore> FlagService<S> {
    pub fn new(store: Arc<S>, policy: TransitionPolicy) -> Self {
        Self::with_sources(store, policy, Arc::new(SystemClock), Box::new(RandomIds))
    }

    pub fn with_sources(
        store: Arc<S>,
        policy: TransitionPolicy,
        clock: Arc<dyn Clock>,
        ids: Box<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            engine: VersioningEngine::new(policy),
            clock,
            ids: Mutex::new(ids),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.engine.policy()
    }

    pub async fn create_flag(&self, caller: Caller, new: &NewFlag) -> Result<FeatureFlag> {
        let outcome = {
            let mut ids = self.ids.lock().await;
            self.engine.create(
                new,
                caller.organization_id,
                caller.user_id,
                self.clock.now(),
                ids.as_mut(),
            )?
        };

        let stored = self.store.create(&outcome.flag, &outcome.entry).await?;
        info!(
            flag = %stored.id,
            organization = %stored.organization_id,
            name = %stored.name,
            "feature flag created"
        );
        Ok(stored)
    }

    /// Load a visible flag owned by the caller's organization.
    pub async fn get(&self, caller: Caller, id: FlagId) -> Result<FeatureFlag> {
        self.load(caller, id, Visibility::ExcludeDeleted).await
    }

    pub async fn get_including_deleted(&self, caller: Caller, id: FlagId) -> Result<FeatureFlag> {
        self.load(caller, id, Visibility::IncludeDeleted).await
    }

    pub async fn list(&self, caller: Caller, page: Page) -> Result<FlagPage> {
        self.store.list(caller.organization_id, page).await
    }

    pub async fn timeline(&self, caller: Caller, id: FlagId) -> Result<TimelineRecord> {
        self.load(caller, id, Visibility::IncludeDeleted).await?;
        self.store.timeline(id).await
    }

    pub async fn org_tags(&self, caller: Caller) -> Result<BTreeSet<String>> {
        self.store.org_tags(caller.organization_id).await
    }

    /// Load the current snapshot and apply `transition` to it.
    pub async fn transition(
        &self,
        caller: Caller,
        id: FlagId,
        transition: &Transition,
    ) -> Result<FeatureFlag> {
        let snapshot = self.get(caller, id).await?;
        self.apply(caller, &snapshot, transition).await
    }

    /// Apply `transition` to a snapshot the caller loaded earlier. The write
    /// only lands if nobody else wrote the flag in between.
    pub async fn apply(
        &self,
        caller: Caller,
        snapshot: &FeatureFlag,
        transition: &Transition,
    ) -> Result<FeatureFlag> {
        if snapshot.organization_id != caller.organization_id {
            return Err(FlagError::FlagNotFound(snapshot.id));
        }

        let outcome = {
            let mut ids = self.ids.lock().await;
            self.engine.apply(
                snapshot,
                caller.user_id,
                transition,
                self.clock.now(),
                ids.as_mut(),
            )?
        };

        match self
            .store
            .commit(&outcome.flag, snapshot.generation, &outcome.entry)
            .await
        {
            Ok(stored) => {
                info!(
                    flag = %stored.id,
                    transition = transition.name(),
                    version = stored.version,
                    generation = stored.generation,
                    "transition committed"
                );
                Ok(stored)
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(flag = %snapshot.id, transition = transition.name(), "{}", e);
                }
                Err(e)
            }
        }
    }

    pub async fn propose(
        &self,
        caller: Caller,
        id: FlagId,
        default_value: &str,
        rules: Vec<RuleSpec>,
    ) -> Result<FeatureFlag> {
        let transition = Transition::Propose {
            default_value: default_value.to_string(),
            rules,
        };
        self.transition(caller, id, &transition).await
    }

    pub async fn approve(&self, caller: Caller, id: FlagId, revision_id: RevisionId) -> Result<FeatureFlag> {
        self.transition(caller, id, &Transition::Approve { revision_id })
            .await
    }

    pub async fn rollback(&self, caller: Caller, id: FlagId) -> Result<FeatureFlag> {
        self.transition(caller, id, &Transition::Rollback).await
    }

    pub async fn toggle_environment(
        &self,
        caller: Caller,
        id: FlagId,
        environment: &str,
    ) -> Result<FeatureFlag> {
        let transition = Transition::ToggleEnvironment {
            environment: environment.to_string(),
        };
        self.transition(caller, id, &transition).await
    }

    pub async fn delete(&self, caller: Caller, id: FlagId) -> Result<FeatureFlag> {
        self.transition(caller, id, &Transition::Delete).await
    }

    /// Merge tags into the flag and into its organization's tag set.
    pub async fn patch_tags(&self, caller: Caller, id: FlagId, tags: &[String]) -> Result<FeatureFlag> {
        let snapshot = self.get(caller, id).await?;
        self.apply_tags(caller, &snapshot, tags).await
    }

    /// Tag merge against a snapshot loaded earlier. The flag and the
    /// organization's tag set are written together or not at all.
    pub async fn apply_tags(
        &self,
        caller: Caller,
        snapshot: &FeatureFlag,
        tags: &[String],
    ) -> Result<FeatureFlag> {
        if snapshot.organization_id != caller.organization_id {
            return Err(FlagError::FlagNotFound(snapshot.id));
        }
        let next = self.engine.merge_tags(snapshot, tags)?;

        if next.tags == snapshot.tags {
            debug!(flag = %snapshot.id, "tags already present");
            self.store
                .merge_org_tags(caller.organization_id, &normalize_tags(tags))
                .await?;
            return Ok(snapshot.clone());
        }

        match self
            .store
            .update_tags(&next, snapshot.generation, &normalize_tags(tags))
            .await
        {
            Ok(stored) => {
                info!(flag = %stored.id, tags = stored.tags.len(), "tags merged");
                Ok(stored)
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(flag = %snapshot.id, "{}", e);
                }
                Err(e)
            }
        }
    }

    async fn load(&self, caller: Caller, id: FlagId, visibility: Visibility) -> Result<FeatureFlag> {
        let flag = self.store.get(id, visibility).await?;
        if flag.organization_id != caller.organization_id {
            debug!(flag = %id, organization = %caller.organization_id, "flag belongs to another organization");
            return Err(FlagError::FlagNotFound(id));
        }
        Ok(flag)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::SteppingClock;
    use crate::ids::SequentialIds;
    use crate::model::{FlagType, RevisionStatus};
    use crate::store::MemoryStore;
    use crate::timeline::Action;

    fn service(policy: TransitionPolicy) -> FlagService<MemoryStore> {
        let start = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let clock = Arc::new(SteppingClock::new(start, 1000));
        FlagService::with_sources(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            policy,
            clock,
            Box::new(SequentialIds::starting_at(500)),
        )
    }

    fn caller() -> Caller {
        Caller::new(
            uuid::Uuid::from_u128(1).into(),
            uuid::Uuid::from_u128(2).into(),
        )
    }

    fn new_flag(tags: &[&str]) -> NewFlag {
        NewFlag {
            name: "checkout-v2".to_string(),
            flag_type: FlagType::Boolean,
            default_value: "false".to_string(),
            rules: vec![],
            environment: "production".to_string(),
            project: Some("web".to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn last_revision(flag: &FeatureFlag) -> RevisionId {
        flag.revisions.iter().last().unwrap().id
    }

    #[tokio::test]
    async fn propose_approve_rollback_round_trip() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&[])).await.unwrap();
        let r1 = last_revision(&flag);

        let flag = svc.propose(caller(), flag.id, "true", vec![]).await.unwrap();
        let r2 = last_revision(&flag);
        assert_eq!(flag.version, 1);

        let flag = svc.approve(caller(), flag.id, r2).await.unwrap();
        assert_eq!(flag.version, 2);
        assert_eq!(flag.live_revision().unwrap().id, r2);
        assert_eq!(flag.live_revision().unwrap().predecessor, Some(r1));

        let flag = svc.rollback(caller(), flag.id).await.unwrap();
        assert_eq!(flag.version, 1);
        assert_eq!(flag.live_revision().unwrap().id, r1);
        assert_eq!(flag.revisions.find_by_id(r2).unwrap().status, RevisionStatus::Draft);

        let timeline = svc.timeline(caller(), flag.id).await.unwrap();
        assert_eq!(
            timeline.actions(),
            vec![
                &Action::Created,
                &Action::RevisionCreated,
                &Action::RevisionApproved,
                &Action::Rollback,
            ]
        );
    }

    #[tokio::test]
    async fn stale_snapshot_is_rejected() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&[])).await.unwrap();
        let flag = svc.propose(caller(), flag.id, "true", vec![]).await.unwrap();
        let r2 = last_revision(&flag);
        let flag = svc.propose(caller(), flag.id, "false", vec![]).await.unwrap();
        let r3 = last_revision(&flag);

        let first = svc.get(caller(), flag.id).await.unwrap();
        let second = first.clone();

        svc.apply(caller(), &first, &Transition::Approve { revision_id: r2 })
            .await
            .unwrap();
        let err = svc
            .apply(caller(), &second, &Transition::Approve { revision_id: r3 })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let stored = svc.get(caller(), flag.id).await.unwrap();
        assert_eq!(stored.live_revision().unwrap().id, r2);
        assert_eq!(stored.version, 2);
        let approvals = svc
            .timeline(caller(), flag.id)
            .await
            .unwrap()
            .actions()
            .into_iter()
            .filter(|a| **a == Action::RevisionApproved)
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn other_organization_cannot_see_or_write() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&[])).await.unwrap();
        let intruder = Caller::new(caller().user_id, uuid::Uuid::from_u128(99).into());

        assert!(svc.get(intruder, flag.id).await.unwrap_err().is_not_found());
        assert!(svc.rollback(intruder, flag.id).await.unwrap_err().is_not_found());
        assert!(svc.timeline(intruder, flag.id).await.unwrap_err().is_not_found());
        let page = svc.list(intruder, Page::default()).await.unwrap();
        assert!(page.flags.is_empty());
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn delete_hides_flag_but_keeps_history() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&[])).await.unwrap();
        svc.delete(caller(), flag.id).await.unwrap();

        assert!(svc.get(caller(), flag.id).await.unwrap_err().is_not_found());
        let deleted = svc.get_including_deleted(caller(), flag.id).await.unwrap();
        assert!(deleted.deleted_at.is_some());
        assert!(svc
            .toggle_environment(caller(), flag.id, "production")
            .await
            .unwrap_err()
            .is_not_found());

        let timeline = svc.timeline(caller(), flag.id).await.unwrap();
        assert_eq!(timeline.actions().last(), Some(&&Action::Deleted));
    }

    #[tokio::test]
    async fn tags_reach_flag_and_organization() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&["web"])).await.unwrap();
        let flag = svc
            .patch_tags(caller(), flag.id, &["beta".to_string(), " web ".to_string()])
            .await
            .unwrap();

        let expected: BTreeSet<String> = ["beta", "web"].iter().map(|s| s.to_string()).collect();
        assert_eq!(flag.tags, expected);
        assert_eq!(svc.org_tags(caller()).await.unwrap(), expected);

        let timeline = svc.timeline(caller(), flag.id).await.unwrap();
        assert_eq!(timeline.entries.len(), 1);
    }

    #[tokio::test]
    async fn rejected_tag_merge_leaves_organization_tags_alone() {
        let svc = service(TransitionPolicy::Strict);
        let flag = svc.create_flag(caller(), &new_flag(&["web"])).await.unwrap();
        let stale = svc.get(caller(), flag.id).await.unwrap();

        svc.rollback(caller(), flag.id).await.unwrap();
        let err = svc
            .apply_tags(caller(), &stale, &["beta".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let web: BTreeSet<String> = ["web".to_string()].into_iter().collect();
        assert_eq!(svc.org_tags(caller()).await.unwrap(), web);
        assert_eq!(svc.get(caller(), flag.id).await.unwrap().tags, web);
    }

    #[tokio::test]
    async fn toggle_records_environment_name() {
        let svc = service(TransitionPolicy::Lenient);
        let flag = svc.create_flag(caller(), &new_flag(&[])).await.unwrap();
        let flag = svc
            .toggle_environment(caller(), flag.id, "production")
            .await
            .unwrap();
        assert!(!flag.environment("production").unwrap().is_enabled);

        let flag = svc.toggle_environment(caller(), flag.id, "staging").await.unwrap();
        assert_eq!(flag.environments.len(), 1);

        let timeline = svc.timeline(caller(), flag.id).await.unwrap();
        assert_eq!(
            timeline.actions().last(),
            Some(&&Action::EnvironmentToggled("staging".to_string()))
        );
    }
}
