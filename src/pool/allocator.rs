//! Slot pool allocator
//!
//! Binds urls to slots of one pool. Each call is a single store
//! transaction:
//!
//! 1. lock any slot live-bound to the url → renew it
//! 2. otherwise lock one free slot → bind it
//! 3. otherwise report [`Allocation::PoolExhausted`]
//!
//! The allocator holds no locks of its own; see [`crate::pool::table`] for
//! how the store keeps concurrent calls from double-binding a url or
//! double-claiming a slot.

use super::slot::{validate_url, PoolKind, Slot, SlotId, SlotOptions};
use super::store::{PoolStats, SlotStore};
use crate::clock::Clock;
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of a single allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// The url already held a live slot; its expiry was extended
    Renewed(Slot),
    /// A free slot was bound to the url
    Bound(Slot),
    /// Every slot is live-bound to some other url
    PoolExhausted,
}

impl Allocation {
    pub fn slot(&self) -> Option<&Slot> {
        match self {
            Allocation::Renewed(slot) | Allocation::Bound(slot) => Some(slot),
            Allocation::PoolExhausted => None,
        }
    }

    pub fn into_slot(self) -> Option<Slot> {
        match self {
            Allocation::Renewed(slot) | Allocation::Bound(slot) => Some(slot),
            Allocation::PoolExhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Allocation::PoolExhausted)
    }
}

/// Outcome of a batch allocation
#[derive(Debug, Clone, Default)]
pub struct BatchAllocation {
    /// One slot per fulfilled url, in first-occurrence order of the input
    pub slots: Vec<Slot>,
    /// Urls that got no slot because the pool ran out
    pub unfulfilled: Vec<String>,
}

/// Transactional allocator over one pool
pub struct SlotAllocator {
    store: Arc<dyn SlotStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("pool", &self.store.pool())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl SlotAllocator {
    pub fn new(store: Arc<dyn SlotStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn pool(&self) -> PoolKind {
        self.store.pool()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Bind `url` to a slot, or renew the slot already bound to it
    #[instrument(skip(self, options), fields(pool = %self.pool()))]
    pub async fn allocate(&self, url: &str, options: SlotOptions) -> Result<Allocation> {
        validate_url(url)?;
        let options = options.for_pool(self.pool());
        let wanted = [url.to_string()];

        let mut tx = self.store.begin().await?;
        let live = tx.lock_live(&wanted, self.clock.now()).await?;
        // lock_live may have waited on the url lock; time moved on
        let now = self.clock.now();
        let expires_at = self.expiry(now)?;

        if let Some(mut slot) = live.into_iter().next() {
            if slot.is_live_for(url, now) {
                slot.renew(expires_at, options);
                tx.update(slot.clone())?;
                tx.commit().await?;
                debug!(slot = %slot.id, "Renewed slot");
                return Ok(Allocation::Renewed(slot));
            }
            // expired while we waited; the row is ours and free
            slot.bind(url.to_string(), expires_at, options);
            tx.update(slot.clone())?;
            tx.commit().await?;
            debug!(slot = %slot.id, "Bound slot");
            return Ok(Allocation::Bound(slot));
        }

        if let Some(mut slot) = tx.lock_free(1, now).await?.into_iter().next() {
            slot.bind(url.to_string(), expires_at, options);
            tx.update(slot.clone())?;
            tx.commit().await?;
            debug!(slot = %slot.id, "Bound slot");
            return Ok(Allocation::Bound(slot));
        }

        // nothing staged; dropping the transaction releases the url lock
        drop(tx);
        info!(pool = %self.pool(), "Pool exhausted");
        Ok(Allocation::PoolExhausted)
    }

    /// Allocate many urls in one transaction
    ///
    /// Duplicates collapse to one slot. Urls with a live binding are renewed;
    /// the rest are paired with free slots in first-occurrence order against
    /// ascending slot ids. Urls left over when the pool runs out are reported
    /// in [`BatchAllocation::unfulfilled`]; that is not an error. Invalid urls
    /// (empty or too long) are skipped.
    #[instrument(skip(self, urls, options), fields(pool = %self.pool(), requested = urls.len()))]
    pub async fn allocate_batch(
        &self,
        urls: &[String],
        options: SlotOptions,
    ) -> Result<BatchAllocation> {
        let options = options.for_pool(self.pool());

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for url in urls {
            if let Err(e) = validate_url(url) {
                warn!(error = %e, "Skipping url in batch");
                continue;
            }
            if seen.insert(url.as_str()) {
                unique.push(url.clone());
            }
        }
        if unique.is_empty() {
            return Ok(BatchAllocation::default());
        }

        let mut tx = self.store.begin().await?;
        let live = tx.lock_live(&unique, self.clock.now()).await?;
        let now = self.clock.now();
        let expires_at = self.expiry(now)?;

        let mut resolved: HashMap<String, Slot> = HashMap::new();
        let mut renewed = 0;
        for mut slot in live {
            let Some(url) = slot.url.clone() else {
                continue;
            };
            if resolved.contains_key(&url) {
                continue;
            }
            if slot.is_live(now) {
                slot.renew(expires_at, options);
                renewed += 1;
            } else {
                slot.bind(url.clone(), expires_at, options);
            }
            tx.update(slot.clone())?;
            resolved.insert(url, slot);
        }

        let pending: Vec<&String> = unique
            .iter()
            .filter(|url| !resolved.contains_key(*url))
            .collect();
        let free = tx.lock_free(pending.len(), now).await?;
        let bound = resolved.len() - renewed + free.len();
        for (url, mut slot) in pending.iter().zip(free) {
            slot.bind((*url).clone(), expires_at, options);
            tx.update(slot.clone())?;
            resolved.insert((*url).clone(), slot);
        }

        tx.commit().await?;

        let mut result = BatchAllocation::default();
        for url in unique {
            match resolved.remove(&url) {
                Some(slot) => result.slots.push(slot),
                None => result.unfulfilled.push(url),
            }
        }

        debug!(
            renewed,
            bound,
            unfulfilled = result.unfulfilled.len(),
            "Batch allocation committed"
        );
        if !result.unfulfilled.is_empty() {
            info!(
                pool = %self.pool(),
                unfulfilled = result.unfulfilled.len(),
                "Pool exhausted during batch allocation"
            );
        }
        Ok(result)
    }

    fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        now.checked_add_signed(self.ttl)
            .ok_or_else(|| Error::Internal(format!("expiry overflows: {} + {}", now, self.ttl)))
    }

    /// Live slot by id; unbound and expired slots resolve to `None`
    pub async fn resolve(&self, id: SlotId) -> Result<Option<Slot>> {
        let now = self.clock.now();
        Ok(self.store.get(id).await?.filter(|slot| slot.is_live(now)))
    }

    /// Like [`SlotAllocator::resolve`] but treats absence as an error
    pub async fn resolve_required(&self, id: SlotId) -> Result<Slot> {
        self.resolve(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} slot {}", self.pool(), id)))
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.store.stats(self.clock.now()).await
    }

    pub async fn compact(&self) -> Result<()> {
        self.store.compact().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pool::table::SlotTable;

    fn new_allocator(pool: PoolKind, capacity: u32) -> Result<(SlotAllocator, Arc<ManualClock>)> {
        let (allocator, _table, clock) = allocator_with_table(pool, capacity)?;
        Ok((allocator, clock))
    }

    fn allocator_with_table(
        pool: PoolKind,
        capacity: u32,
    ) -> Result<(SlotAllocator, Arc<SlotTable>, Arc<ManualClock>)> {
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(SlotTable::in_memory(pool, capacity)?);
        let allocator = SlotAllocator::new(table.clone(), clock.clone(), Duration::hours(24));
        Ok((allocator, table, clock))
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_allocate_binds_then_renews() -> Result<()> {
        let (allocator, clock) = new_allocator(PoolKind::TextImage, 4)?;

        let first = allocator.allocate("https://a", SlotOptions::default()).await?;
        let Allocation::Bound(bound) = first.clone() else {
            panic!("expected a fresh binding, got {:?}", first);
        };
        assert_eq!(bound.expires_at, Some(clock.now() + Duration::hours(24)));

        clock.advance(Duration::hours(1));
        let second = allocator.allocate("https://a", SlotOptions::default()).await?;
        let Allocation::Renewed(renewed) = second.clone() else {
            panic!("expected a renewal, got {:?}", second);
        };
        assert_eq!(renewed.id, bound.id);
        assert_eq!(renewed.expires_at, Some(clock.now() + Duration::hours(24)));
        Ok(())
    }

    #[tokio::test]
    async fn test_renewal_merges_options() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::TextImage, 4)?;

        let a = allocator.allocate("x", SlotOptions::new(100, true)).await?;
        let b = allocator.allocate("x", SlotOptions::new(50, false)).await?;

        let (a, b) = (a.into_slot().unwrap(), b.into_slot().unwrap());
        assert_eq!(a.id, b.id);
        assert_eq!(b.max_size, 100);
        assert!(!b.allow_cache);

        let stored = allocator.resolve(b.id).await?.unwrap();
        assert_eq!(stored, b);
        Ok(())
    }

    #[tokio::test]
    async fn test_rebinding_after_expiry_resets_options() -> Result<()> {
        let (allocator, clock) = new_allocator(PoolKind::TextImage, 1)?;

        allocator.allocate("x", SlotOptions::new(100, false)).await?;
        clock.advance(Duration::hours(24));

        let again = allocator.allocate("x", SlotOptions::new(20, true)).await?;
        let Allocation::Bound(slot) = again.clone() else {
            panic!("expired binding must be rebound, got {:?}", again);
        };
        assert_eq!(slot.max_size, 20);
        assert!(slot.allow_cache);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhaustion_and_recycling() -> Result<()> {
        let (allocator, clock) = new_allocator(PoolKind::Video, 2)?;

        allocator.allocate("a", SlotOptions::default()).await?;
        allocator.allocate("b", SlotOptions::default()).await?;
        assert!(allocator.allocate("c", SlotOptions::default()).await?.is_exhausted());

        // a url already bound still renews in a full pool
        assert!(matches!(
            allocator.allocate("a", SlotOptions::default()).await?,
            Allocation::Renewed(_)
        ));

        clock.advance(Duration::hours(25));
        assert!(matches!(
            allocator.allocate("c", SlotOptions::default()).await?,
            Allocation::Bound(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_video_pool_ignores_image_options() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::Video, 2)?;
        let slot = allocator
            .allocate("v", SlotOptions::new(640, false))
            .await?
            .into_slot()
            .unwrap();
        assert_eq!(slot.max_size, 0);
        assert!(slot.allow_cache);
        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_rejects_invalid_url() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::TextImage, 2)?;
        let result = allocator.allocate("", SlotOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_collapses_duplicates() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::TextImage, 8)?;

        let batch = allocator
            .allocate_batch(&urls(&["a", "a", "b"]), SlotOptions::default())
            .await?;
        assert_eq!(batch.slots.len(), 2);
        assert!(batch.unfulfilled.is_empty());
        assert_ne!(batch.slots[0].id, batch.slots[1].id);
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_partial_fulfilment() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::TextImage, 2)?;

        let batch = allocator
            .allocate_batch(&urls(&["a", "b", "c"]), SlotOptions::default())
            .await?;
        assert_eq!(batch.slots.len(), 2);
        assert_eq!(batch.unfulfilled, urls(&["c"]));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_renews_existing_bindings() -> Result<()> {
        let (allocator, _clock) = new_allocator(PoolKind::TextImage, 3)?;

        let existing = allocator
            .allocate("b", SlotOptions::new(300, true))
            .await?
            .into_slot()
            .unwrap();

        let batch = allocator
            .allocate_batch(&urls(&["a", "b", "c", ""]), SlotOptions::new(100, false))
            .await?;
        assert_eq!(batch.slots.len(), 3);

        let b = batch
            .slots
            .iter()
            .find(|slot| slot.url.as_deref() == Some("b"))
            .unwrap();
        assert_eq!(b.id, existing.id);
        assert_eq!(b.max_size, 300);
        assert!(!b.allow_cache);

        let stats = allocator.stats().await?;
        assert_eq!(stats.live, 3);
        assert_eq!(stats.free, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_hides_free_slots() -> Result<()> {
        let (allocator, clock) = new_allocator(PoolKind::TextImage, 2)?;

        assert!(allocator.resolve(SlotId::new(1)).await?.is_none());
        assert!(allocator.resolve(SlotId::new(99)).await?.is_none());
        assert!(matches!(
            allocator.resolve_required(SlotId::new(1)).await,
            Err(Error::NotFound(_))
        ));

        let slot = allocator
            .allocate("u", SlotOptions::default())
            .await?
            .into_slot()
            .unwrap();
        assert!(allocator.resolve(slot.id).await?.is_some());

        clock.advance(Duration::hours(24));
        assert!(allocator.resolve(slot.id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_binding_that_expires_during_url_wait_is_rebound() -> Result<()> {
        let (allocator, table, clock) = allocator_with_table(PoolKind::TextImage, 2)?;
        let allocator = Arc::new(allocator);
        let first = allocator
            .allocate("x", SlotOptions::new(100, false))
            .await?
            .into_slot()
            .unwrap();

        clock.advance(Duration::hours(23));
        let mut held = table.begin().await?;
        assert_eq!(held.lock_live(&urls(&["x"]), clock.now()).await?.len(), 1);

        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.allocate("x", SlotOptions::new(20, true)).await })
        };
        // let the waiter queue up on the url lock
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        clock.advance(Duration::hours(2));
        drop(held);

        let result = waiter.await.expect("join")?;
        let Allocation::Bound(slot) = result.clone() else {
            panic!("expired binding must be rebound, got {:?}", result);
        };
        assert_eq!(slot.id, first.id);
        assert_eq!(slot.expires_at, Some(clock.now() + Duration::hours(24)));
        assert_eq!((slot.max_size, slot.allow_cache), (20, true));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_rebinds_binding_that_expired_during_url_wait() -> Result<()> {
        let (allocator, table, clock) = allocator_with_table(PoolKind::TextImage, 3)?;
        let allocator = Arc::new(allocator);
        allocator.allocate("x", SlotOptions::new(100, false)).await?;

        clock.advance(Duration::hours(23));
        let mut held = table.begin().await?;
        held.lock_live(&urls(&["x"]), clock.now()).await?;

        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                allocator
                    .allocate_batch(&urls(&["x", "y"]), SlotOptions::new(20, true))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        clock.advance(Duration::hours(2));
        drop(held);

        let batch = waiter.await.expect("join")?;
        assert_eq!(batch.slots.len(), 2);
        for slot in &batch.slots {
            assert_eq!(slot.expires_at, Some(clock.now() + Duration::hours(24)));
            assert_eq!((slot.max_size, slot.allow_cache), (20, true));
        }
        Ok(())
    }
}
