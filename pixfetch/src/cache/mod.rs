//! Bounded bitmap caches.
//!
//! The engine runs two independent cache tiers built from the same
//! [`BoundedCache`] type: one for full-resolution bitmaps keyed by URL and
//! one for size-scaled variants keyed by URL plus pixel dimensions. Each
//! tier has its own cost and entry-count limits.

mod bounded;

pub use bounded::{BoundedCache, CacheLimits, CacheStats};
