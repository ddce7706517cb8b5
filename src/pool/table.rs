//! Provisioned pool table with row-level exclusive locks
//!
//! # Architecture
//!
//! ```text
//! SlotTable (one per pool)
//!   ├─→ rows:      RwLock<Vec<Slot>>        committed view, ids 1..=N
//!   ├─→ row_locks: [Mutex; N]               held by a transaction until commit/drop
//!   ├─→ url_locks: [Mutex; STRIPES]         hash(url) → stripe, taken before
//!   │                                       looking for a live binding
//!   └─→ journal:   SlotJournal (optional)   one batch per commit
//! ```
//!
//! A transaction locates candidate rows in the committed view, locks them,
//! then re-reads and re-checks each one. Rows that stopped matching while
//! the lock was being acquired are released and ignored, so "locate then
//! lock" behaves atomically. Url stripes give the same guarantee for rows
//! that do not exist yet: two transactions looking for the same url
//! serialize on its stripe, so neither can bind it while the other is
//! deciding whether it is already bound.

use super::journal::SlotJournal;
use super::slot::{PoolKind, Slot, SlotId};
use super::store::{PoolStats, SlotStore, SlotTransaction};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Number of url lock stripes per table
const URL_LOCK_STRIPES: usize = 256;

/// How a table is provisioned and persisted
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Slots to provision (ids `1..=capacity`)
    pub capacity: u32,
    /// Bound on every lock wait inside a transaction
    pub lock_timeout: Duration,
    /// Journal file; `None` keeps the table in memory only
    pub journal_path: Option<PathBuf>,
    /// Journal batches before automatic compaction (0 disables)
    pub compact_after_batches: u64,
}

impl TableOptions {
    pub fn in_memory(capacity: u32) -> Self {
        Self {
            capacity,
            lock_timeout: Duration::from_secs(5),
            journal_path: None,
            compact_after_batches: 0,
        }
    }

    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_compaction(mut self, after_batches: u64) -> Self {
        self.compact_after_batches = after_batches;
        self
    }
}

struct TableInner {
    pool: PoolKind,
    rows: RwLock<Vec<Slot>>,
    row_locks: Vec<Arc<RowLock<()>>>,
    url_locks: Vec<Arc<RowLock<()>>>,
    journal: Option<Mutex<SlotJournal>>,
    lock_timeout: Duration,
    compact_after_batches: u64,
}

impl TableInner {
    fn committed(&self, id: SlotId) -> Option<Slot> {
        id.index().and_then(|i| self.rows.read().get(i).cloned())
    }

    /// Rows worth persisting in a snapshot
    fn snapshot(&self) -> Vec<Slot> {
        self.rows
            .read()
            .iter()
            .filter(|slot| !slot.is_pristine())
            .cloned()
            .collect()
    }

    fn write_rows(&self, rows: Vec<Slot>) {
        let mut view = self.rows.write();
        for row in rows {
            if let Some(i) = row.id.index() {
                if let Some(current) = view.get_mut(i) {
                    *current = row;
                }
            }
        }
    }

    /// Make a transaction's rows durable, then visible
    fn apply(&self, rows: Vec<Slot>) -> Result<()> {
        let Some(journal) = &self.journal else {
            self.write_rows(rows);
            return Ok(());
        };

        // Held across append and apply so compaction never snapshots a
        // view that is missing an appended batch.
        let mut journal = journal.lock();
        if journal.is_failed() {
            // rebuild the file from the committed rows
            journal.compact(self.snapshot())?;
        }
        journal.append(rows.clone())?;
        self.write_rows(rows);

        if self.compact_after_batches > 0
            && journal.batches_since_compact() >= self.compact_after_batches
        {
            if let Err(e) = journal.compact(self.snapshot()) {
                // the commit itself is already durable
                warn!(pool = %self.pool, error = %e, "Automatic journal compaction failed");
            }
        }
        Ok(())
    }
}

/// In-process table for one pool
#[derive(Clone)]
pub struct SlotTable {
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("pool", &self.inner.pool)
            .field("capacity", &self.inner.row_locks.len())
            .finish()
    }
}

impl SlotTable {
    /// Provision a table and replay its journal, if any
    pub fn open(pool: PoolKind, options: TableOptions) -> Result<Self> {
        if options.capacity == 0 {
            return Err(Error::InvalidArgument(format!(
                "Pool '{}' needs at least one slot",
                pool
            )));
        }

        let capacity = options.capacity as usize;
        let mut rows: Vec<Slot> = (1..=options.capacity)
            .map(|id| Slot::new(SlotId::new(id)))
            .collect();

        let journal = match &options.journal_path {
            Some(path) => {
                let (journal, recovered) = SlotJournal::open(path)?;
                let mut ignored = 0usize;
                for (id, row) in recovered.rows {
                    match id.index().filter(|&i| i < capacity) {
                        Some(i) => rows[i] = row,
                        None => ignored += 1,
                    }
                }
                if ignored > 0 {
                    warn!(
                        pool = %pool,
                        ignored,
                        capacity,
                        "Journal holds rows beyond the provisioned capacity"
                    );
                }
                Some(Mutex::new(journal))
            }
            None => None,
        };

        info!(
            pool = %pool,
            capacity,
            durable = journal.is_some(),
            "Opened slot table"
        );

        Ok(Self {
            inner: Arc::new(TableInner {
                pool,
                rows: RwLock::new(rows),
                row_locks: (0..capacity).map(|_| Arc::new(RowLock::new(()))).collect(),
                url_locks: (0..URL_LOCK_STRIPES)
                    .map(|_| Arc::new(RowLock::new(())))
                    .collect(),
                journal,
                lock_timeout: options.lock_timeout,
                compact_after_batches: options.compact_after_batches,
            }),
        })
    }

    /// Memory-only table, mainly for tests and tooling
    pub fn in_memory(pool: PoolKind, capacity: u32) -> Result<Self> {
        Self::open(pool, TableOptions::in_memory(capacity))
    }
}

#[async_trait]
impl SlotStore for SlotTable {
    fn pool(&self) -> PoolKind {
        self.inner.pool
    }

    fn capacity(&self) -> usize {
        self.inner.row_locks.len()
    }

    async fn begin(&self) -> Result<Box<dyn SlotTransaction>> {
        Ok(Box::new(TableTransaction {
            table: self.inner.clone(),
            url_guards: BTreeMap::new(),
            row_guards: BTreeMap::new(),
            staged: BTreeMap::new(),
            committed: false,
        }))
    }

    async fn get(&self, id: SlotId) -> Result<Option<Slot>> {
        Ok(self.inner.committed(id))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<PoolStats> {
        let rows = self.inner.rows.read();
        let live = rows.iter().filter(|slot| slot.is_live(now)).count();
        Ok(PoolStats {
            pool: self.inner.pool,
            capacity: rows.len(),
            live,
            free: rows.len() - live,
        })
    }

    async fn compact(&self) -> Result<()> {
        if let Some(journal) = &self.inner.journal {
            let mut journal = journal.lock();
            journal.compact(self.inner.snapshot())?;
        }
        Ok(())
    }
}

fn url_stripe(url: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    (hasher.finish() % URL_LOCK_STRIPES as u64) as usize
}

/// Wait for a lock, giving up after `timeout`
async fn acquire(lock: &Arc<RowLock<()>>, timeout: Duration) -> Option<OwnedMutexGuard<()>> {
    tokio::time::timeout(timeout, lock.clone().lock_owned())
        .await
        .ok()
}

fn lock_conflict(timeout: Duration, what: String) -> Error {
    Error::TransactionConflict(format!("Timed out after {:?} waiting for {}", timeout, what))
}

struct TableTransaction {
    table: Arc<TableInner>,
    url_guards: BTreeMap<usize, OwnedMutexGuard<()>>,
    row_guards: BTreeMap<SlotId, OwnedMutexGuard<()>>,
    staged: BTreeMap<SlotId, Slot>,
    committed: bool,
}

impl TableTransaction {
    /// Row as this transaction sees it: staged version first
    fn current(&self, id: SlotId) -> Result<Slot> {
        if let Some(slot) = self.staged.get(&id) {
            return Ok(slot.clone());
        }
        self.table
            .committed(id)
            .ok_or_else(|| Error::Internal(format!("Slot {} is not provisioned", id)))
    }

    fn row_lock(&self, id: SlotId) -> Result<&Arc<RowLock<()>>> {
        id.index()
            .and_then(|i| self.table.row_locks.get(i))
            .ok_or_else(|| Error::Internal(format!("Slot {} is not provisioned", id)))
    }

    async fn lock_row(&mut self, id: SlotId) -> Result<()> {
        if self.row_guards.contains_key(&id) {
            return Ok(());
        }
        let lock = self.row_lock(id)?.clone();
        let timeout = self.table.lock_timeout;
        let guard = acquire(&lock, timeout)
            .await
            .ok_or_else(|| lock_conflict(timeout, format!("{} slot {}", self.table.pool, id)))?;
        self.row_guards.insert(id, guard);
        Ok(())
    }

    async fn lock_urls(&mut self, urls: &[String]) -> Result<()> {
        let stripes: BTreeSet<usize> = urls.iter().map(|url| url_stripe(url)).collect();
        for stripe in stripes {
            if self.url_guards.contains_key(&stripe) {
                continue;
            }
            let lock = self.table.url_locks[stripe].clone();
            let timeout = self.table.lock_timeout;
            let guard = acquire(&lock, timeout).await.ok_or_else(|| {
                lock_conflict(timeout, format!("{} url stripe {}", self.table.pool, stripe))
            })?;
            self.url_guards.insert(stripe, guard);
        }
        Ok(())
    }

    /// Keep `id` locked if it is still free, otherwise let it go
    fn claim_if_free(
        &mut self,
        id: SlotId,
        guard: OwnedMutexGuard<()>,
        now: DateTime<Utc>,
    ) -> Result<Option<Slot>> {
        let slot = self.current(id)?;
        if slot.is_free(now) {
            self.row_guards.insert(id, guard);
            Ok(Some(slot))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl SlotTransaction for TableTransaction {
    async fn lock_live(&mut self, urls: &[String], now: DateTime<Utc>) -> Result<Vec<Slot>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        self.lock_urls(urls).await?;

        let wanted: HashSet<&str> = urls.iter().map(String::as_str).collect();
        let matches = |slot: &Slot| {
            slot.is_live(now) && slot.url.as_deref().is_some_and(|u| wanted.contains(u))
        };

        let mut candidates: BTreeSet<SlotId> = self
            .table
            .rows
            .read()
            .iter()
            .filter(|&slot| matches(slot))
            .map(|slot| slot.id)
            .collect();
        candidates.extend(
            self.staged
                .values()
                .filter(|&slot| matches(slot))
                .map(|slot| slot.id),
        );

        let mut found = Vec::with_capacity(candidates.len());
        for id in candidates {
            self.lock_row(id).await?;
            let slot = self.current(id)?;
            if matches(&slot) {
                found.push(slot);
            }
        }
        Ok(found)
    }

    async fn lock_free(&mut self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Slot>> {
        let mut claimed = Vec::new();
        if limit == 0 {
            return Ok(claimed);
        }

        let candidates: Vec<SlotId> = self
            .table
            .rows
            .read()
            .iter()
            .filter(|slot| slot.is_free(now) && !self.row_guards.contains_key(&slot.id))
            .map(|slot| slot.id)
            .collect();

        // First pass skips rows other transactions are holding.
        let mut busy = Vec::new();
        for id in candidates {
            if claimed.len() == limit {
                break;
            }
            let lock = self.row_lock(id)?.clone();
            match lock.try_lock_owned() {
                Ok(guard) => {
                    if let Some(slot) = self.claim_if_free(id, guard, now)? {
                        claimed.push(slot);
                    }
                }
                Err(_) => busy.push(id),
            }
        }

        // Second pass waits for them; a holder that does not let go in
        // time is most likely binding the row itself.
        for id in busy {
            if claimed.len() == limit {
                break;
            }
            let lock = self.row_lock(id)?.clone();
            match acquire(&lock, self.table.lock_timeout).await {
                Some(guard) => {
                    if let Some(slot) = self.claim_if_free(id, guard, now)? {
                        claimed.push(slot);
                    }
                }
                None => {
                    debug!(pool = %self.table.pool, slot = %id, "Skipping free slot held by another transaction");
                }
            }
        }

        Ok(claimed)
    }

    fn update(&mut self, slot: Slot) -> Result<()> {
        if !self.row_guards.contains_key(&slot.id) {
            return Err(Error::Internal(format!(
                "Slot {} updated without holding its lock",
                slot.id
            )));
        }
        self.staged.insert(slot.id, slot);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if !self.staged.is_empty() {
            let rows: Vec<Slot> = self.staged.values().cloned().collect();
            self.table.apply(rows)?;
            debug!(pool = %self.table.pool, rows = self.staged.len(), "Committed slot transaction");
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for TableTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            debug!(
                pool = %self.table.pool,
                rows = self.staged.len(),
                "Rolled back slot transaction"
            );
        }
    }
}
