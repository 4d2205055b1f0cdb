pub mod memory;
#[cfg(feature = "sled")]
pub mod sled_store;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FlagError, Result};
use crate::model::{FeatureFlag, FlagId, OrganizationId};
use crate::timeline::{TimelineEntry, TimelineRecord};

pub use memory::MemoryStore;
#[cfg(feature = "sled")]
pub use sled_store::SledStore;

/// Whether soft-deleted flags are visible to a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    ExcludeDeleted,
    IncludeDeleted,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

impl Default for Page {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.filter(|p| *p > 0).unwrap_or(DEFAULT_PAGE),
            page_size: page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.page_size as usize)
    }
}

/// One page of an organization's flags. `total` counts every visible flag,
/// not just the ones on this page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagPage {
    pub flags: Vec<FeatureFlag>,
    pub page: u32,
    pub page_size: u32,
    pub total: usize,
}

/// Persistence of flag aggregates.
///
/// Every write is conditioned on the flag identity, the owning organization
/// and the generation the caller loaded. A mismatch on identity or
/// organization reads as not-found, a stale generation as [`FlagError::Conflict`].
/// Successful writes stamp `updated_at` and advance `generation`.
#[async_trait]
pub trait FlagRepository: Send + Sync {
    async fn get(&self, id: FlagId, visibility: Visibility) -> Result<FeatureFlag>;

    /// Non-deleted flags of an organization, newest first.
    async fn list(&self, organization_id: OrganizationId, page: Page) -> Result<FlagPage>;

    /// Replace the stored document if its generation still equals
    /// `expected_generation`.
    async fn update(&self, flag: &FeatureFlag, expected_generation: u64) -> Result<FeatureFlag>;
}

/// Append-only per-flag audit trail.
#[async_trait]
pub trait TimelineLog: Send + Sync {
    async fn append(&self, flag_id: FlagId, entry: &TimelineEntry) -> Result<()>;

    async fn timeline(&self, flag_id: FlagId) -> Result<TimelineRecord>;
}

/// A backend that can write a flag together with its timeline entry and its
/// organization's tag set as one unit.
#[async_trait]
pub trait FlagStore: FlagRepository + TimelineLog {
    /// Insert a new flag together with the timeline holding its first entry,
    /// and union the flag's tags into its organization's tag set. Fails if the
    /// identity is taken.
    async fn create(&self, flag: &FeatureFlag, entry: &TimelineEntry) -> Result<FeatureFlag>;

    /// Conditional update plus timeline append. Either both land or neither.
    async fn commit(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        entry: &TimelineEntry,
    ) -> Result<FeatureFlag>;

    /// Conditional update of a flag whose tag set changed, plus the union of
    /// `tags` into its organization's tag set. Either both land or neither.
    async fn update_tags(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        tags: &BTreeSet<String>,
    ) -> Result<FeatureFlag>;

    /// Union `tags` into the organization's tag set, returning the result.
    async fn merge_org_tags(
        &self,
        organization_id: OrganizationId,
        tags: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>>;

    async fn org_tags(&self, organization_id: OrganizationId) -> Result<BTreeSet<String>>;
}

/// Shared precondition check for `update`/`commit`.
pub(crate) fn check_write(stored: &FeatureFlag, incoming: &FeatureFlag, expected: u64) -> Result<()> {
    if stored.organization_id != incoming.organization_id {
        return Err(FlagError::FlagNotFound(incoming.id));
    }
    if stored.generation != expected {
        return Err(FlagError::Conflict {
            id: incoming.id,
            expected,
            found: stored.generation,
        });
    }
    Ok(())
}

/// Newest first, ties broken by identity so pages are stable.
pub(crate) fn paginate(mut flags: Vec<FeatureFlag>, page: Page) -> FlagPage {
    flags.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    let total = flags.len();
    FlagPage {
        flags: flags
            .into_iter()
            .skip(page.offset())
            .take(page.page_size as usize)
            .collect(),
        page: page.page,
        page_size: page.page_size,
        total,
    }
}
