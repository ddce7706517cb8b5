//! Slots, pools and the bind/renew rules

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest URL a slot may hold
pub const MAX_URL_LENGTH: usize = 5000;

/// Stable identifier of a slot within its pool
///
/// Assigned once at provisioning (1..=capacity) and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// Position of this slot in a table provisioned from id 1
    pub(crate) fn index(&self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Independently managed set of slots for one resource class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Text and image URLs; slots carry image sizing options
    TextImage,
    /// Video URLs
    Video,
}

impl PoolKind {
    pub const ALL: [PoolKind; 2] = [PoolKind::TextImage, PoolKind::Video];

    pub fn table_name(&self) -> &'static str {
        match self {
            PoolKind::TextImage => "text_urls",
            PoolKind::Video => "video_urls",
        }
    }

    /// Whether slots of this pool honour `max_size` / `allow_cache`
    pub fn supports_image_options(&self) -> bool {
        matches!(self, PoolKind::TextImage)
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::TextImage => write!(f, "text"),
            PoolKind::Video => write!(f, "video"),
        }
    }
}

impl FromStr for PoolKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" | "image" => Ok(PoolKind::TextImage),
            "video" => Ok(PoolKind::Video),
            other => Err(Error::InvalidArgument(format!("Invalid pool type: {}", other))),
        }
    }
}

/// Image handling requested by a registrant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOptions {
    /// Longest-edge bound for image responses; 0 means pass through untouched
    pub max_size: u32,
    /// Whether processed image bytes may be kept on disk
    pub allow_cache: bool,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            max_size: 0,
            allow_cache: true,
        }
    }
}

impl SlotOptions {
    pub fn new(max_size: u32, allow_cache: bool) -> Self {
        Self {
            max_size,
            allow_cache,
        }
    }

    /// Combine with a renewing registrant: widest size, most restrictive cache
    pub fn merge(self, requested: SlotOptions) -> SlotOptions {
        SlotOptions {
            max_size: self.max_size.max(requested.max_size),
            allow_cache: self.allow_cache && requested.allow_cache,
        }
    }

    /// Options actually stored for a pool; video slots never carry any
    pub fn for_pool(self, pool: PoolKind) -> SlotOptions {
        if pool.supports_image_options() {
            self
        } else {
            SlotOptions::default()
        }
    }
}

/// A row of a pool table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_size: u32,
    pub allow_cache: bool,
}

impl Slot {
    /// A provisioned, never-bound slot
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            url: None,
            expires_at: None,
            max_size: 0,
            allow_cache: true,
        }
    }

    /// Holds a url whose expiry is strictly in the future
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.url.is_some() && self.expires_at.is_some_and(|at| at > now)
    }

    pub fn is_free(&self, now: DateTime<Utc>) -> bool {
        !self.is_live(now)
    }

    pub fn is_live_for(&self, url: &str, now: DateTime<Utc>) -> bool {
        self.url.as_deref() == Some(url) && self.is_live(now)
    }

    pub fn options(&self) -> SlotOptions {
        SlotOptions::new(self.max_size, self.allow_cache)
    }

    /// Whether the row carries nothing worth persisting
    pub fn is_pristine(&self) -> bool {
        *self == Slot::new(self.id)
    }

    /// Bind a free slot; options are taken as requested, nothing is merged
    pub fn bind(&mut self, url: String, expires_at: DateTime<Utc>, options: SlotOptions) {
        self.url = Some(url);
        self.expires_at = Some(expires_at);
        self.max_size = options.max_size;
        self.allow_cache = options.allow_cache;
    }

    /// Extend a live binding, merging options with the previous registrants
    pub fn renew(&mut self, expires_at: DateTime<Utc>, options: SlotOptions) {
        let merged = self.options().merge(options);
        self.expires_at = Some(expires_at);
        self.max_size = merged.max_size;
        self.allow_cache = merged.allow_cache;
    }
}

/// Check a url before it reaches a pool
pub fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(Error::InvalidArgument("URL must not be empty".to_string()));
    }
    if url.chars().count() > MAX_URL_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "URL too long: {} chars (max {})",
            url.chars().count(),
            MAX_URL_LENGTH
        )));
    }
    Ok(())
}
