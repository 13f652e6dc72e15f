//! Pixfetch - concurrent image fetch-and-cache engine.
//!
//! Given a URL and an optional target display size, [`ImageLoader`]
//! delivers a decoded bitmap, fetching each distinct cache key over the
//! network at most once. Full-resolution bitmaps and size-scaled variants
//! live in independent cost-bounded cache tiers, requests can be cancelled
//! individually, and a process-wide memory-pressure signal flushes both
//! tiers.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pixfetch::{ImageLoader, LoaderConfig, MemoryPressureSource, ReqwestClient, TargetSize};
//!
//! let pressure = MemoryPressureSource::new();
//! let network = Arc::new(ReqwestClient::new()?);
//! let loader = ImageLoader::new(network, LoaderConfig::default(), &pressure);
//!
//! let request = loader.load("https://host/a.png", Some(TargetSize::new(120.0, 80.0)));
//! if let Some(bitmap) = request.bitmap().await {
//!     // hand the bitmap to the view layer
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod error;
pub mod key;
pub mod loader;
pub mod net;
pub mod pressure;

mod registry;

pub use cache::{BoundedCache, CacheLimits, CacheStats};
pub use codec::DecodeError;
pub use error::LoadError;
pub use key::{ImageKey, PixelSize, TargetSize};
pub use loader::{ImageLoader, ImageRequest, LoaderConfig};
pub use net::{BoxFuture, NetworkClient, NetworkError, ReqwestClient};
pub use pressure::MemoryPressureSource;
pub use registry::RequestToken;
