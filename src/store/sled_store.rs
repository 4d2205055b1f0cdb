use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::Transactional;
use tracing::debug;

use super::{
    check_write, paginate, FlagPage, FlagRepository, FlagStore, Page, TimelineLog, Visibility,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{FlagError, Result};
use crate::model::{FeatureFlag, FlagId, OrganizationId};
use crate::timeline::{TimelineEntry, TimelineRecord};

/// Persistent flag storage backed by sled.
///
/// Documents are JSON encoded. Trees:
/// - `flags`: flag id -> `FeatureFlag`
/// - `timelines`: flag id -> `TimelineRecord`
/// - `flags_by_org`: organization id ++ flag id -> ()
/// - `org_tags`: organization id -> tag set
///
/// Writes that touch more than one tree run in a single sled transaction.
pub struct SledStore {
    db: sled::Db,
    flags: sled::Tree,
    timelines: sled::Tree,
    by_org: sled::Tree,
    org_tags: sled::Tree,
    clock: Arc<dyn Clock>,
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<FlagError>>;

fn abort(e: FlagError) -> ConflictableTransactionError<FlagError> {
    ConflictableTransactionError::Abort(e)
}

fn storage(context: &str, e: sled::Error) -> FlagError {
    FlagError::Storage(format!("{}: {}", context, e))
}

fn from_tx<T>(result: TransactionResult<T, FlagError>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage("transaction failed", e),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl SledStore {
    pub fn new(db: sled::Db) -> Result<Self> {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: sled::Db, clock: Arc<dyn Clock>) -> Result<Self> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| storage(&format!("failed to open tree {}", name), e))
        };
        Ok(Self {
            flags: open("flags")?,
            timelines: open("timelines")?,
            by_org: open("flags_by_org")?,
            org_tags: open("org_tags")?,
            db,
            clock,
        })
    }

    /// Open a sled database at the given directory path.
    pub fn open(data_dir: &str) -> Result<Self> {
        let db = sled::open(data_dir).map_err(|e| storage("failed to open sled db", e))?;
        Self::new(db)
    }

    /// A throwaway database removed on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage("failed to open sled db", e))?;
        Self::new(db)
    }

    fn flag_key(id: FlagId) -> Vec<u8> {
        id.as_uuid().as_bytes().to_vec()
    }

    fn org_key(organization_id: OrganizationId) -> Vec<u8> {
        organization_id.as_uuid().as_bytes().to_vec()
    }

    fn org_flag_key(organization_id: OrganizationId, id: FlagId) -> Vec<u8> {
        let mut key = Self::org_key(organization_id);
        key.extend_from_slice(id.as_uuid().as_bytes());
        key
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| storage("failed to flush", e))?;
        Ok(())
    }

    fn read_flag(&self, id: FlagId) -> Result<Option<FeatureFlag>> {
        match self
            .flags
            .get(Self::flag_key(id))
            .map_err(|e| storage("failed to read flag", e))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stamp a first-write copy of `flag`.
    fn initial(&self, flag: &FeatureFlag) -> FeatureFlag {
        let mut stored = flag.clone();
        stored.generation = 1;
        stored.updated_at = self.clock.now();
        stored
    }
}

/// Conditional overwrite inside a transaction on the `flags` tree.
fn write_flag_tx(
    flags: &sled::transaction::TransactionalTree,
    flag: &FeatureFlag,
    expected_generation: u64,
    now: chrono::DateTime<chrono::Utc>,
) -> TxResult<FeatureFlag> {
    let key = SledStore::flag_key(flag.id);
    let stored: FeatureFlag = match flags.get(&key)? {
        Some(bytes) => decode(&bytes).map_err(abort)?,
        None => return Err(abort(FlagError::FlagNotFound(flag.id))),
    };
    if stored.is_deleted() {
        return Err(abort(FlagError::FlagNotFound(flag.id)));
    }
    check_write(&stored, flag, expected_generation).map_err(abort)?;

    let mut next = flag.clone();
    next.generation = stored.generation + 1;
    next.updated_at = now;
    flags.insert(key, encode(&next).map_err(abort)?)?;
    Ok(next)
}

fn push_entry_tx(
    timelines: &sled::transaction::TransactionalTree,
    flag_id: FlagId,
    entry: &TimelineEntry,
) -> TxResult<()> {
    let key = SledStore::flag_key(flag_id);
    let mut record: TimelineRecord = match timelines.get(&key)? {
        Some(bytes) => decode(&bytes).map_err(abort)?,
        None => TimelineRecord::new(flag_id),
    };
    record.push(entry.clone());
    timelines.insert(key, encode(&record).map_err(abort)?)?;
    Ok(())
}

fn merge_tags_tx(
    org_tags: &sled::transaction::TransactionalTree,
    organization_id: OrganizationId,
    tags: &BTreeSet<String>,
) -> TxResult<BTreeSet<String>> {
    let key = SledStore::org_key(organization_id);
    let mut set: BTreeSet<String> = match org_tags.get(&key)? {
        Some(bytes) => decode(&bytes).map_err(abort)?,
        None => BTreeSet::new(),
    };
    set.extend(tags.iter().cloned());
    org_tags.insert(key, encode(&set).map_err(abort)?)?;
    Ok(set)
}

#[async_trait]
impl FlagRepository for SledStore {
    async fn get(&self, id: FlagId, visibility: Visibility) -> Result<FeatureFlag> {
        match self.read_flag(id)? {
            Some(flag) if visibility == Visibility::IncludeDeleted || !flag.is_deleted() => Ok(flag),
            _ => Err(FlagError::FlagNotFound(id)),
        }
    }

    async fn list(&self, organization_id: OrganizationId, page: Page) -> Result<FlagPage> {
        let prefix = Self::org_key(organization_id);
        let mut flags = Vec::new();
        for item in self.by_org.scan_prefix(&prefix) {
            let (key, _) = item.map_err(|e| storage("failed to scan flags", e))?;
            let id_bytes: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| FlagError::Storage("unexpected index key format".to_string()))?;
            let id = FlagId::from(uuid::Uuid::from_bytes(id_bytes));
            if let Some(flag) = self.read_flag(id)? {
                if !flag.is_deleted() {
                    flags.push(flag);
                }
            }
        }
        Ok(paginate(flags, page))
    }

    async fn update(&self, flag: &FeatureFlag, expected_generation: u64) -> Result<FeatureFlag> {
        let now = self.clock.now();
        let stored = from_tx(
            self.flags
                .transaction(|flags| write_flag_tx(flags, flag, expected_generation, now)),
        )?;
        self.flush()?;
        Ok(stored)
    }
}

#[async_trait]
impl TimelineLog for SledStore {
    async fn append(&self, flag_id: FlagId, entry: &TimelineEntry) -> Result<()> {
        from_tx((&self.flags, &self.timelines).transaction(|(flags, timelines)| {
            if flags.get(Self::flag_key(flag_id))?.is_none() {
                return Err(abort(FlagError::FlagNotFound(flag_id)));
            }
            push_entry_tx(timelines, flag_id, entry)
        }))?;
        self.flush()
    }

    async fn timeline(&self, flag_id: FlagId) -> Result<TimelineRecord> {
        if self.read_flag(flag_id)?.is_none() {
            return Err(FlagError::FlagNotFound(flag_id));
        }
        match self
            .timelines
            .get(Self::flag_key(flag_id))
            .map_err(|e| storage("failed to read timeline", e))?
        {
            Some(bytes) => decode(&bytes),
            None => Ok(TimelineRecord::new(flag_id)),
        }
    }
}

#[async_trait]
impl FlagStore for SledStore {
    async fn create(&self, flag: &FeatureFlag, entry: &TimelineEntry) -> Result<FeatureFlag> {
        let stored = self.initial(flag);
        let doc = encode(&stored)?;
        let mut record = TimelineRecord::new(stored.id);
        record.push(entry.clone());
        let timeline_doc = encode(&record)?;

        let trees = (&self.flags, &self.timelines, &self.by_org, &self.org_tags);
        from_tx(trees.transaction(|(flags, timelines, by_org, org_tags)| {
            let key = Self::flag_key(stored.id);
            if flags.get(&key)?.is_some() {
                return Err(abort(FlagError::Storage(format!(
                    "feature flag {} already exists",
                    stored.id
                ))));
            }
            flags.insert(key.clone(), doc.clone())?;
            timelines.insert(key, timeline_doc.clone())?;
            by_org.insert(Self::org_flag_key(stored.organization_id, stored.id), Vec::<u8>::new())?;
            if !stored.tags.is_empty() {
                merge_tags_tx(org_tags, stored.organization_id, &stored.tags)?;
            }
            Ok(())
        }))?;
        self.flush()?;
        debug!(flag = %stored.id, "sled store: created flag");
        Ok(stored)
    }

    async fn commit(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        entry: &TimelineEntry,
    ) -> Result<FeatureFlag> {
        let now = self.clock.now();
        let stored = from_tx((&self.flags, &self.timelines).transaction(|(flags, timelines)| {
            let next = write_flag_tx(flags, flag, expected_generation, now)?;
            push_entry_tx(timelines, next.id, entry)?;
            Ok(next)
        }))?;
        self.flush()?;
        Ok(stored)
    }

    async fn update_tags(
        &self,
        flag: &FeatureFlag,
        expected_generation: u64,
        tags: &BTreeSet<String>,
    ) -> Result<FeatureFlag> {
        let now = self.clock.now();
        let stored = from_tx((&self.flags, &self.org_tags).transaction(|(flags, org_tags)| {
            let next = write_flag_tx(flags, flag, expected_generation, now)?;
            merge_tags_tx(org_tags, next.organization_id, tags)?;
            Ok(next)
        }))?;
        self.flush()?;
        Ok(stored)
    }

    async fn merge_org_tags(
        &self,
        organization_id: OrganizationId,
        tags: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let merged = from_tx(
            self.org_tags
                .transaction(|tree| merge_tags_tx(tree, organization_id, tags)),
        )?;
        self.flush()?;
        Ok(merged)
    }

    async fn org_tags(&self, organization_id: OrganizationId) -> Result<BTreeSet<String>> {
        match self
            .org_tags
            .get(Self::org_key(organization_id))
            .map_err(|e| storage("failed to read organization tags", e))?
        {
            Some(bytes) => decode(&bytes),
            None => Ok(BTreeSet::new()),
        }
    }
}
