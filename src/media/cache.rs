//! Coalescing image cache
//!
//! At most one computation runs per `(url, max_dimension)` key. Callers that
//! arrive while it is running wait on the same shared future and all see the
//! same outcome. The computation runs on its own task, so a caller going away
//! never cancels work other callers depend on.

use super::disk::DiskCache;
use super::fetch::{FetchError, ImageSource};
use super::image::fit_within;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, FetchError>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    url: String,
    max_dimension: u32,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    coalesced: AtomicU64,
    disk_hits: AtomicU64,
    upstream_fetches: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaCacheStats {
    pub requests: u64,
    pub coalesced: u64,
    pub disk_hits: u64,
    pub upstream_fetches: u64,
    pub failures: u64,
    pub in_flight: usize,
}

struct CacheInner {
    source: Arc<dyn ImageSource>,
    disk: DiskCache,
    in_flight: DashMap<FetchKey, SharedFetch>,
    counters: Counters,
}

/// Removes the in-flight entry however the computation ends
struct InFlightGuard {
    inner: Arc<CacheInner>,
    key: FetchKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

#[derive(Clone)]
pub struct MediaCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for MediaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCache")
            .field("cache_dir", &self.inner.disk.dir())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl MediaCache {
    pub fn new(source: Arc<dyn ImageSource>, disk: DiskCache) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                disk,
                in_flight: DashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn disk(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// Image bytes for `url`, fitted inside `max_dimension` (0 = unbounded)
    ///
    /// With `allow_cache` the disk cache is consulted first and the result
    /// is stored on success. When a call joins a computation that is already
    /// running, the first caller's `allow_cache` applies.
    #[instrument(skip(self))]
    pub async fn get_or_fetch(
        &self,
        url: &str,
        max_dimension: u32,
        allow_cache: bool,
    ) -> Result<Bytes, FetchError> {
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);
        let key = FetchKey {
            url: url.to_string(),
            max_dimension,
        };

        let shared = match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight fetch");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let shared = self.spawn_computation(key, allow_cache);
                entry.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    /// Number of keys currently being computed
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Wait for every computation running right now to finish
    pub async fn drain(&self) {
        let pending: Vec<SharedFetch> = self
            .inner
            .in_flight
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "Draining in-flight fetches");
        futures::future::join_all(pending).await;
    }

    pub fn stats(&self) -> MediaCacheStats {
        let counters = &self.inner.counters;
        MediaCacheStats {
            requests: counters.requests.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            disk_hits: counters.disk_hits.load(Ordering::Relaxed),
            upstream_fetches: counters.upstream_fetches.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.len(),
        }
    }

    // Called with the vacant entry's shard write lock held. The task may
    // start and even finish on another worker before the insert, but
    // InFlightGuard::drop goes through DashMap::remove, which blocks on that
    // same shard lock until the vacant entry has inserted and released it.
    // tokio::spawn never polls inline, so this thread cannot deadlock on it.
    fn spawn_computation(&self, key: FetchKey, allow_cache: bool) -> SharedFetch {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard {
                inner: inner.clone(),
                key: key.clone(),
            };
            let result = inner.compute(&key, allow_cache).await;
            if let Err(e) = &result {
                inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %key.url, max_dimension = key.max_dimension, error = %e, "Image fetch failed");
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

impl CacheInner {
    async fn compute(&self, key: &FetchKey, allow_cache: bool) -> Result<Bytes, FetchError> {
        if allow_cache {
            match self.disk.read(&key.url, key.max_dimension).await {
                Ok(Some(bytes)) => {
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Disk cache read failed, fetching upstream"),
            }
        }

        self.counters.upstream_fetches.fetch_add(1, Ordering::Relaxed);
        let raw = self.source.fetch(&key.url).await?;

        let max_dimension = key.max_dimension;
        let processed = tokio::task::spawn_blocking(move || fit_within(raw, max_dimension))
            .await
            .map_err(|e| FetchError::Aborted(e.to_string()))??;

        if allow_cache {
            if let Err(e) = self.disk.write(&key.url, key.max_dimension, &processed).await {
                warn!(error = %e, "Failed to store image in disk cache");
            }
        }

        Ok(processed)
    }
}
