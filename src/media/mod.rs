//! Media Fetch Cache
//!
//! Downloads images, fits them inside a requested bound and keeps the
//! result on disk, with one computation per `(url, max_dimension)` at a time.
//!
//! ```text
//! MediaCache::get_or_fetch(url, max, allow_cache)
//!   ├─→ in-flight registry   join a running computation, or start one
//!   └─→ spawned computation
//!         ├─→ DiskCache        <sha256(url)>_<max>.png
//!         ├─→ ImageSource      HttpImageSource (reqwest)
//!         └─→ fit_within       decode / resize / PNG (blocking pool)
//! ```

pub mod cache;
pub mod disk;
pub mod fetch;
pub mod image;

pub use cache::{MediaCache, MediaCacheStats};
pub use disk::DiskCache;
pub use fetch::{FetchConfig, FetchError, HttpImageSource, ImageSource};
pub use self::image::{fit_within, scaled_size};
