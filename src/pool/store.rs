//! Slot store boundary
//!
//! The allocator never locks anything itself. All mutual exclusion comes
//! from the store's transactions: a row returned by [`SlotTransaction::lock_live`]
//! or [`SlotTransaction::lock_free`] stays exclusively owned by that
//! transaction until it commits or is dropped.

use super::slot::{PoolKind, Slot, SlotId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Occupancy of a pool at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool: PoolKind,
    pub capacity: usize,
    pub live: usize,
    pub free: usize,
}

/// Storage holding the provisioned rows of one pool
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Pool served by this store
    fn pool(&self) -> PoolKind;

    /// Number of provisioned slots
    fn capacity(&self) -> usize;

    /// Start a unit of work
    async fn begin(&self) -> Result<Box<dyn SlotTransaction>>;

    /// Committed state of one row, without taking its lock
    async fn get(&self, id: SlotId) -> Result<Option<Slot>>;

    /// Count live and free rows at `now`
    async fn stats(&self, now: DateTime<Utc>) -> Result<PoolStats>;

    /// Rewrite persistent state to its minimal form
    async fn compact(&self) -> Result<()>;
}

/// Exclusive-lock transaction over a pool
///
/// Dropping a transaction without calling [`SlotTransaction::commit`] rolls
/// back every staged change and releases its locks.
#[async_trait]
pub trait SlotTransaction: Send {
    /// Lock and return the rows live-bound to any of `urls`
    ///
    /// Also serializes against other transactions asking about the same
    /// urls, so a url found unbound here stays unbound until this
    /// transaction ends.
    async fn lock_live(&mut self, urls: &[String], now: DateTime<Utc>) -> Result<Vec<Slot>>;

    /// Lock and return up to `limit` free rows, lowest id first
    async fn lock_free(&mut self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Slot>>;

    /// Stage a new version of a row this transaction holds locked
    fn update(&mut self, slot: Slot) -> Result<()>;

    /// Persist all staged rows atomically and release the locks
    async fn commit(self: Box<Self>) -> Result<()>;
}
