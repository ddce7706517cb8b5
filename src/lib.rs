// urlpool - stable integer slots for volatile URLs
// Fixed-size pools recycled through TTL expiry, plus a coalescing image cache

#![warn(rust_2018_idioms)]

pub mod clock;
pub mod config;
pub mod media;
pub mod pool;
pub mod service;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServiceConfig;
pub use media::{FetchError, MediaCache};
pub use pool::{Allocation, PoolKind, Slot, SlotAllocator, SlotId, SlotOptions};
pub use service::{RegisteredSlot, Registration, UrlPoolService};

/// urlpool error types
pub mod error {
    use crate::media::FetchError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        /// Lock wait expired or the transaction could not complete; the
        /// whole unit of work was rolled back and may be retried.
        #[error("Transaction conflict: {0}")]
        TransactionConflict(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Fetch error: {0}")]
        Fetch(#[from] FetchError),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
