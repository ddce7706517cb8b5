//! Service facade
//!
//! Owns both pools and the media cache, and is what a routing layer calls.
//! Nothing here is global: build one with [`UrlPoolService::open`] from a
//! [`ServiceConfig`], or hand [`UrlPoolService::new`] pre-built parts.

use crate::clock::{Clock, SystemClock};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::media::{DiskCache, FetchConfig, HttpImageSource, MediaCache, MediaCacheStats};
use crate::pool::{
    Allocation, PoolKind, PoolStats, Slot, SlotAllocator, SlotId, SlotOptions, SlotTable,
    TableOptions,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// A slot handed back to a registrant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredSlot {
    pub id: SlotId,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl RegisteredSlot {
    fn from_slot(slot: Slot) -> Result<Self> {
        match (slot.url, slot.expires_at) {
            (Some(url), Some(expires_at)) => Ok(Self {
                id: slot.id,
                url,
                expires_at,
            }),
            _ => Err(Error::Internal(format!(
                "slot {} allocated without a binding",
                slot.id
            ))),
        }
    }
}

/// Outcome of [`UrlPoolService::register`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Registration {
    Registered(RegisteredSlot),
    PoolExhausted,
}

impl Registration {
    pub fn slot(&self) -> Option<&RegisteredSlot> {
        match self {
            Registration::Registered(slot) => Some(slot),
            Registration::PoolExhausted => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pools: Vec<PoolStats>,
    pub media: MediaCacheStats,
}

#[derive(Debug)]
pub struct UrlPoolService {
    text: SlotAllocator,
    video: SlotAllocator,
    media: MediaCache,
    max_image_dimension: u32,
}

impl UrlPoolService {
    pub fn new(
        text: SlotAllocator,
        video: SlotAllocator,
        media: MediaCache,
        max_image_dimension: u32,
    ) -> Self {
        Self {
            text,
            video,
            media,
            max_image_dimension,
        }
    }

    /// Provision both pools (replaying their journals) and the media cache
    pub fn open(config: &ServiceConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: &ServiceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let ttl = config.ttl()?;

        let open_pool = |pool: PoolKind, capacity: u32| -> Result<SlotAllocator> {
            let options = TableOptions::in_memory(capacity)
                .with_journal(config.journal_path(pool))
                .with_lock_timeout(config.lock_timeout())
                .with_compaction(config.compact_after_batches);
            let table = SlotTable::open(pool, options)?;
            Ok(SlotAllocator::new(Arc::new(table), clock.clone(), ttl))
        };
        let text = open_pool(PoolKind::TextImage, config.text_pool_size)?;
        let video = open_pool(PoolKind::Video, config.video_pool_size)?;

        let source = HttpImageSource::new(FetchConfig {
            timeout: config.fetch_timeout(),
            max_size: config.max_fetch_bytes,
        })?;
        let media = MediaCache::new(Arc::new(source), DiskCache::new(config.cache_dir.clone()));

        info!(
            data_dir = ?config.data_dir,
            cache_dir = ?config.cache_dir,
            text_pool_size = config.text_pool_size,
            video_pool_size = config.video_pool_size,
            "urlpool service opened"
        );
        Ok(Self::new(text, video, media, config.max_image_dimension))
    }

    pub fn allocator(&self, pool: PoolKind) -> &SlotAllocator {
        match pool {
            PoolKind::TextImage => &self.text,
            PoolKind::Video => &self.video,
        }
    }

    pub fn media(&self) -> &MediaCache {
        &self.media
    }

    fn check_options(&self, options: SlotOptions) -> Result<()> {
        if options.max_size > self.max_image_dimension {
            return Err(Error::InvalidArgument(format!(
                "maxSize {} exceeds limit {}",
                options.max_size, self.max_image_dimension
            )));
        }
        Ok(())
    }

    /// Bind or renew a slot for `url`
    pub async fn register(
        &self,
        pool: PoolKind,
        url: &str,
        options: SlotOptions,
    ) -> Result<Registration> {
        self.check_options(options)?;
        match self.allocator(pool).allocate(url, options).await? {
            Allocation::Renewed(slot) | Allocation::Bound(slot) => {
                Ok(Registration::Registered(RegisteredSlot::from_slot(slot)?))
            }
            Allocation::PoolExhausted => Ok(Registration::PoolExhausted),
        }
    }

    /// Register many urls at once
    ///
    /// Urls the pool had no room for are simply missing from the result.
    pub async fn register_batch(
        &self,
        pool: PoolKind,
        urls: &[String],
        options: SlotOptions,
    ) -> Result<Vec<RegisteredSlot>> {
        self.check_options(options)?;
        let batch = self.allocator(pool).allocate_batch(urls, options).await?;
        batch
            .slots
            .into_iter()
            .map(RegisteredSlot::from_slot)
            .collect()
    }

    /// Live slot by id; anything else is [`Error::NotFound`]
    pub async fn resolve(&self, pool: PoolKind, id: SlotId) -> Result<Slot> {
        self.allocator(pool).resolve_required(id).await
    }

    pub async fn fetch_image(
        &self,
        url: &str,
        max_dimension: u32,
        allow_cache: bool,
    ) -> Result<Bytes> {
        if max_dimension > self.max_image_dimension {
            return Err(Error::InvalidArgument(format!(
                "size {} exceeds limit {}",
                max_dimension, self.max_image_dimension
            )));
        }
        Ok(self.media.get_or_fetch(url, max_dimension, allow_cache).await?)
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let mut pools = Vec::with_capacity(PoolKind::ALL.len());
        for pool in PoolKind::ALL {
            pools.push(self.allocator(pool).stats().await?);
        }
        Ok(ServiceStats {
            pools,
            media: self.media.stats(),
        })
    }

    /// Rewrite both journals as snapshots
    pub async fn compact(&self) -> Result<()> {
        for pool in PoolKind::ALL {
            self.allocator(pool).compact().await?;
        }
        Ok(())
    }

    /// Wait for in-flight image work before dropping the service
    pub async fn shutdown(&self) {
        self.media.drain().await;
        info!("urlpool service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service(dir: &std::path::Path, clock: Arc<ManualClock>) -> Result<UrlPoolService> {
        let config = ServiceConfig {
            data_dir: dir.join("data"),
            cache_dir: dir.join("cache"),
            text_pool_size: 4,
            video_pool_size: 2,
            max_image_dimension: 512,
            ..ServiceConfig::default()
        };
        UrlPoolService::open_with_clock(&config, clock)
    }

    #[tokio::test]
    async fn test_register_and_resolve() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let clock = Arc::new(ManualClock::starting_now());
        let service = service(dir.path(), clock.clone())?;

        let registration = service
            .register(PoolKind::TextImage, "https://a", SlotOptions::new(100, true))
            .await?;
        let Registration::Registered(registered) = registration else {
            panic!("expected a slot, got {:?}", registration);
        };
        assert_eq!(registered.url, "https://a");
        assert_eq!(registered.expires_at, clock.now() + chrono::Duration::hours(24));

        let slot = service.resolve(PoolKind::TextImage, registered.id).await?;
        assert_eq!(slot.url.as_deref(), Some("https://a"));
        assert_eq!(slot.max_size, 100);

        // same id in the other pool is unbound
        assert!(matches!(
            service.resolve(PoolKind::Video, registered.id).await,
            Err(Error::NotFound(_))
        ));

        clock.advance(chrono::Duration::hours(24));
        assert!(matches!(
            service.resolve(PoolKind::TextImage, registered.id).await,
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_max_size_limit() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let service = service(dir.path(), Arc::new(ManualClock::starting_now()))?;

        let result = service
            .register(PoolKind::TextImage, "https://a", SlotOptions::new(513, true))
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = service.fetch_image("https://a", 4096, true).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_register_batch_is_lossy() -> Result<()> {
        let dir = tempfile::tempdir().map_err(|e| Error::Storage(e.to_string()))?;
        let service = service(dir.path(), Arc::new(ManualClock::starting_now()))?;

        let urls: Vec<String> = ["a", "b", "c"].iter().map(|u| format!("https://{}", u)).collect();
        let slots = service
            .register_batch(PoolKind::Video, &urls, SlotOptions::default())
            .await?;
        assert_eq!(slots.len(), 2);

        let exhausted = service
            .register(PoolKind::Video, "https://d", SlotOptions::default())
            .await?;
        assert_eq!(exhausted, Registration::PoolExhausted);

        let stats = service.stats().await?;
        let video = stats
            .pools
            .iter()
            .find(|p| p.pool == PoolKind::Video)
            .expect("video stats");
        assert_eq!((video.live, video.free), (2, 0));
        Ok(())
    }

    #[test]
    fn test_registered_slot_serializes_camel_case() {
        let slot = RegisteredSlot {
            id: SlotId::new(7),
            url: "https://a".to_string(),
            expires_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&slot).expect("serialize");
        assert_eq!(json["id"], 7);
        assert_eq!(json["url"], "https://a");
        assert!(json.get("expiresAt").is_some());

        let json = serde_json::to_value(Registration::Registered(slot)).expect("serialize");
        assert_eq!(json["status"], "registered");
        assert_eq!(json["id"], 7);
    }
}
