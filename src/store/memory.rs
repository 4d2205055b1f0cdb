use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    check_write, paginate, FlagPage, FlagRepository, FlagStore, Page, TimelineLog, Visibility,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{FlagError, Result};
use crate::model::{FeatureFlag, FlagId, OrganizationId};
use crate::timeline::{TimelineEntry, TimelineRecord};

#[derive(Default)]
struct Inner {
    flags: HashMap<FlagId, FeatureFlag>,
    timelines: HashMap<FlagId, TimelineRecord>,
    org_tags: HashMap<OrganizationId, BTreeSet<String>>,
}

impl Inner {
    fn write_flag(
        &mut self,
        flag: &FeatureFlag,
        expected_generation: u64,
        clock: &dyn Clock,
    ) -> Result<FeatureFlag> {
        let stored = self
            .flags
            .get(&flag.id)
            .filter(|f| !f.is_deleted())
            .ok_or(FlagError::FlagNotFound(flag.id))?;
        check_write(stored, flag, expected_generation)?;

        let mut next = flag.clone();
        next.generation = stored.generation + 1;
        next.updated_at = clock.now();
        self.flags.insert(next.id, next.clone());
        Ok(next)
    }

    fn merge_org_tags(
        &mut self,
        organization_id: OrganizationId,
        tags: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let set = self.org_tags.entry(organization_id).or_default();
        set.extend(tags.iter().cloned());
        set.clone()
    }

    fn push_entry(&mut self, flag_id: FlagId, entry: &TimelineEntry) {
        self.timelines
            .entry(flag_id)
            .or_insert_with(|| TimelineRecord::new(flag_id))
            .push(entry.clone());
    }
}

/// In-memory flag storage behind a single `RwLock`, so a flag write, its
/// timeline append and its organization tag merge always happen under the
/// same guard.
pub struct MemoryStore {
    data: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: RwLock::new(Inner::default()),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlagRepository for MemoryStore {
    async fn get(&self, id: FlagId, visibility: Visibility) -> Result<FeatureFlag> {
        let data = self.data.read().await;
        match data.flags.get(&id) {
            Some(flag) if visibility == Visibility::IncludeDeleted || !flag.is_deleted() => {
                Ok(flag.clone())
            }
            _ => Err(FlagError::FlagNotFound(id)),
        }
    }

    async fn list(&self, organization_id: OrganizationId, page: Page) -> Result<FlagPage> {
        let data = self.data.read().await;
        let flags = data
            .flags
            .values()
            .filter(|f| f.organization_id == organization_id && !f.is_deleted())
            .cloned()
            .collect();
        Ok(paginate(flags, page))
    }

    async fn update(&self, flag: &FeatureFlag, expected_generation: u64) -> Result<FeatureFlag> {
        let mut data = self.data.write().await;
        data.write_flag(flag, expected_generation, self.clock.as_ref())
    }
}

#[async_trait]
impl TimelineLog for MemoryStore {
    async fn append(&self, flag_id: FlagId, entry: &TimelineEntry) -> Result<()> {
        let mut data = self.data.write().await;
        if !data.flags.contains_key(&flag_id) {
            return Err(FlagError::FlagNotFound(flag_id));
        }
        data.push_entry(flag_id, entry);
        Ok(())
    }

    async fn timeline(&self, flag_id: FlagId) -> Result<TimelineRecord> {
        let data = self.data.read().await;
        if !data.flags.contains_key(&flag_id) {
            return Err(FlagError::FlagNotFound(flag_id));
        }
        Ok(data
            .timelines
            .get(&flag_id)
            .cloned()
            .unwrap_or_else(|| TimelineRecord::new(flag_id)))
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn create(&self, flag: &FeatureFlag, entry: &TimelineEntry) -> Result<FeatureFlag> {
        let mut data = self.data.write().await;
        if data.flags.contains_key(&flag.id) {
            return Err(FlagError::Storage(format!("feature flag {} already exists", flag.id)));
        }
        let mut stored = flag.clone();
        stored.generation = 1;
        stored.updated_at = self.clock.now();
        data.flags.insert(stored.id, stored.clone());
        data.timelines.insert(stored.id, TimelineRecord::new(stored.id));
        data.push_entry(stored.id, entry);
        if !stored.tags.is_empty() {
            data.merge_org_tags(stored.organization_id, &stored.tags);
        }
        debug!(flag = %stored.id, "memory store: created flag");
        Ok(stored)
    }

    async fn commit(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        entry: &TimelineEntry,
    ) -> Result<FeatureFlag> {
        let mut data = self.data.write().await;
        let stored = data.write_flag(flag, expected_generation, self.clock.as_ref())?;
        data.push_entry(stored.id, entry);
        Ok(stored)
    }

    async fn update_tags(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        tags: &BTreeSet<String>,
    ) -> Result<FeatureFlag> {
        let mut data = self.data.write().await;
        let stored = data.write_flag(flag, expected_generation, self.clock.as_ref())?;
        data.merge_org_tags(stored.organization_id, tags);
        Ok(stored)
    }

    async fn merge_org_tags(
        &self,
        organization_id: OrganizationId,
        tags: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let mut data = self.data.write().await;
        Ok(data.merge_org_tags(organization_id, tags))
    }

    async fn org_tags(&self, organization_id: OrganizationId) -> Result<BTreeSet<String>> {
        let data = self.data.read().await;
        Ok(data.org_tags.get(&organization_id).cloned().unwrap_or_default())
    }
}
