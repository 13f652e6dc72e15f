//! Image loader orchestration.
//!
//! [`ImageLoader`] is the public entry point of the engine. A `load` call
//! resolves its cache key, then takes the cheapest path available:
//!
//! 1. **Exact hit** on the matching tier delivers the cached bitmap.
//! 2. **Scaled miss with the original resident** derives the scaled
//!    variant from the cached full-resolution bitmap, with no network
//!    fetch.
//! 3. **Full miss** joins an outstanding fetch for the key, or starts one.
//!
//! Fetch and decode run on spawned tasks; `load` and `cancel` return
//! without blocking. Every completion is funneled through one delivery
//! task, so deliveries never interleave from the caller's point of view
//! and never happen before `load` returns, cache hits included.
//!
//! # Cancellation
//!
//! `cancel` detaches one token from its in-flight operation. Other tokens
//! joined to the same key are unaffected; detaching the last token aborts
//! the underlying fetch. Cancelling a token that already delivered, or one
//! that was satisfied straight from cache, is a no-op.
//!
//! # Memory Pressure
//!
//! The loader subscribes to a [`MemoryPressureSource`] at construction.
//! On a pressure event both cache tiers are cleared; in-flight fetches are
//! not cancelled and re-populate the empty caches when they complete.

use std::sync::Arc;

use image::DynamicImage;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{BoundedCache, CacheLimits};
use crate::codec::{self, DecodeError};
use crate::error::LoadError;
use crate::key::{ImageKey, TargetSize};
use crate::net::NetworkClient;
use crate::pressure::MemoryPressureSource;
use crate::registry::{DeliverySender, InFlightRegistry, Registration, RequestToken};

/// Configuration for an [`ImageLoader`].
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    /// Limits for the full-resolution tier.
    pub original_cache: CacheLimits,
    /// Limits for the size-scaled tier.
    pub scaled_cache: CacheLimits,
    /// Multiplier from display points to pixels.
    pub device_scale: f32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            // Originals are large and reused verbatim; scaled variants are
            // small and numerous.
            original_cache: CacheLimits::new(128 * 1024 * 1024, 128),
            scaled_cache: CacheLimits::new(32 * 1024 * 1024, 512),
            device_scale: 1.0,
        }
    }
}

/// One completion queued for the delivery funnel.
struct Delivery {
    waiters: Vec<DeliverySender>,
    result: Option<Arc<DynamicImage>>,
}

/// Handle to one `load` call.
///
/// Carries the request token for [`ImageLoader::cancel`] and resolves
/// exactly once with the decoded bitmap, or `None` on failure or
/// cancellation.
pub struct ImageRequest {
    token: RequestToken,
    rx: oneshot::Receiver<Option<Arc<DynamicImage>>>,
}

impl ImageRequest {
    /// The token identifying this request.
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Waits for delivery. A cancelled request resolves to `None`.
    pub async fn bitmap(self) -> Option<Arc<DynamicImage>> {
        self.rx.await.unwrap_or(None)
    }
}

/// Concurrent image fetch-and-cache engine.
///
/// Owns two bounded cache tiers and an in-flight registry. Construct one
/// at process start and share it by reference or `Arc`; there is no hidden
/// process-wide instance.
pub struct ImageLoader {
    original: Arc<BoundedCache>,
    scaled: Arc<BoundedCache>,
    registry: Arc<InFlightRegistry>,
    network: Arc<dyn NetworkClient>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    device_scale: f32,
    shutdown: CancellationToken,
}

impl ImageLoader {
    /// Creates a loader and starts its background tasks.
    ///
    /// Must be called from within a tokio runtime. The loader subscribes
    /// to `pressure` once here; the subscription ends when the loader is
    /// dropped.
    pub fn new(
        network: Arc<dyn NetworkClient>,
        config: LoaderConfig,
        pressure: &MemoryPressureSource,
    ) -> Self {
        let original = Arc::new(BoundedCache::new("original", config.original_cache));
        let scaled = Arc::new(BoundedCache::new("scaled", config.scaled_cache));
        let shutdown = CancellationToken::new();

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_delivery(delivery_rx));
        tokio::spawn(run_pressure_listener(
            pressure.subscribe(),
            Arc::clone(&original),
            Arc::clone(&scaled),
            shutdown.clone(),
        ));

        Self {
            original,
            scaled,
            registry: Arc::new(InFlightRegistry::new()),
            network,
            delivery_tx,
            device_scale: config.device_scale,
            shutdown,
        }
    }

    /// Requests the image at `url`, optionally downsampled to fit
    /// `target_size` at the configured device scale.
    ///
    /// Returns synchronously; the bitmap (or `None`) arrives through the
    /// returned [`ImageRequest`] exactly once.
    pub fn load(&self, url: &str, target_size: Option<TargetSize>) -> ImageRequest {
        let key = ImageKey::for_request(url, target_size, self.device_scale);
        let (tx, rx) = oneshot::channel();

        // Exact hit: the token never enters the registry.
        if let Some(image) = self.tier_for(&key).get(&key) {
            let token = self.registry.issue_token();
            trace!(key = %key, %token, "cache hit");
            self.enqueue(vec![tx], Some(image));
            return ImageRequest { token, rx };
        }

        // A scaled miss can be served from the resident original without
        // touching the network.
        if let ImageKey::Scaled { url, size } = &key {
            let original_key = ImageKey::Original { url: url.clone() };
            if let Some(original) = self.original.get(&original_key) {
                let max_dimension = size.max_dimension();
                return match self.registry.begin_or_join(&key, tx) {
                    Registration::Joined { token } => ImageRequest { token, rx },
                    Registration::New { token, cancel } => {
                        debug!(key = %key, %token, "deriving scaled variant from cached original");
                        self.spawn_derive(key.clone(), original, max_dimension, cancel);
                        ImageRequest { token, rx }
                    }
                };
            }
        }

        // Full miss: join the outstanding fetch or start one.
        match self.registry.begin_or_join(&key, tx) {
            Registration::Joined { token } => {
                trace!(key = %key, %token, "joined in-flight fetch");
                ImageRequest { token, rx }
            }
            Registration::New { token, cancel } => {
                debug!(key = %key, %token, "starting fetch");
                self.spawn_fetch(key, cancel);
                ImageRequest { token, rx }
            }
        }
    }

    /// Cancels one request.
    ///
    /// Resolves the same key `load` would for these arguments. Safe to
    /// call after the request has delivered.
    pub fn cancel(&self, url: &str, target_size: Option<TargetSize>, token: RequestToken) {
        let key = ImageKey::for_request(url, target_size, self.device_scale);
        let remaining = self.registry.cancel_token(&key, token);
        trace!(key = %key, %token, remaining, "cancel");
    }

    /// Drops every cached bitmap in both tiers.
    ///
    /// In-flight fetches are unaffected and re-populate the caches when
    /// they complete.
    pub fn flush(&self) {
        self.original.clear();
        self.scaled.clear();
        info!("caches flushed");
    }

    /// The full-resolution cache tier.
    pub fn original_cache(&self) -> &BoundedCache {
        &self.original
    }

    /// The size-scaled cache tier.
    pub fn scaled_cache(&self) -> &BoundedCache {
        &self.scaled
    }

    /// Number of keys with outstanding operations.
    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    fn tier_for(&self, key: &ImageKey) -> &Arc<BoundedCache> {
        match key {
            ImageKey::Original { .. } => &self.original,
            ImageKey::Scaled { .. } => &self.scaled,
        }
    }

    fn enqueue(&self, waiters: Vec<DeliverySender>, result: Option<Arc<DynamicImage>>) {
        let _ = self.delivery_tx.send(Delivery { waiters, result });
    }

    /// Produce the scaled variant for `key` from the cached original.
    fn spawn_derive(
        &self,
        key: ImageKey,
        original: Arc<DynamicImage>,
        max_dimension: u32,
        cancel: CancellationToken,
    ) {
        let scaled_cache = Arc::clone(&self.scaled);
        let registry = Arc::clone(&self.registry);
        let delivery_tx = self.delivery_tx.clone();
        tokio::spawn(async move {
            let result = derive_scaled(original, max_dimension, &cancel).await;
            if let Some(image) = &result {
                scaled_cache.insert(key.clone(), Arc::clone(image), codec::bitmap_cost(image));
            }
            let waiters = registry.complete(&key);
            let _ = delivery_tx.send(Delivery { waiters, result });
        });
    }

    /// Fetch, decode, and cache the bitmap for `key`.
    fn spawn_fetch(&self, key: ImageKey, cancel: CancellationToken) {
        let network = Arc::clone(&self.network);
        let original = Arc::clone(&self.original);
        let scaled = Arc::clone(&self.scaled);
        let registry = Arc::clone(&self.registry);
        let delivery_tx = self.delivery_tx.clone();
        tokio::spawn(async move {
            let result = match fetch_and_decode(network.as_ref(), &key, &cancel).await {
                Ok(image) => {
                    let image = Arc::new(image);
                    let cost = codec::bitmap_cost(&image);
                    let tier = match &key {
                        ImageKey::Original { .. } => &original,
                        ImageKey::Scaled { .. } => &scaled,
                    };
                    tier.insert(key.clone(), Arc::clone(&image), cost);
                    debug!(key = %key, cost, "fetch complete");
                    Some(image)
                }
                Err(LoadError::Cancelled) => {
                    trace!(key = %key, "fetch aborted");
                    None
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "fetch failed");
                    None
                }
            };
            // Insert-before-complete: a load arriving between the two sees
            // either the cached bitmap or the still-open registration,
            // never a gap that would start a duplicate fetch.
            let waiters = registry.complete(&key);
            let _ = delivery_tx.send(Delivery { waiters, result });
        });
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resolve the scaled bitmap for a derive operation.
///
/// An original already within the bound is shared as-is rather than
/// copied.
async fn derive_scaled(
    original: Arc<DynamicImage>,
    max_dimension: u32,
    cancel: &CancellationToken,
) -> Option<Arc<DynamicImage>> {
    if cancel.is_cancelled() {
        return None;
    }
    if codec::within_bound(&original, max_dimension) {
        return Some(original);
    }
    let worker = tokio::task::spawn_blocking(move || codec::downsample(&original, max_dimension));
    match worker.await {
        Ok(image) => Some(Arc::new(image)),
        Err(e) => {
            warn!(error = %e, "downsample worker failed");
            None
        }
    }
}

/// Fetch bytes for `key` and decode them per the requested variant.
async fn fetch_and_decode(
    network: &dyn NetworkClient,
    key: &ImageKey,
    cancel: &CancellationToken,
) -> Result<DynamicImage, LoadError> {
    let bytes = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(LoadError::Cancelled),
        result = network.fetch(key.url()) => result.map_err(LoadError::Network)?,
    };

    let max_dimension = key.pixel_size().map(|size| size.max_dimension());
    let worker = tokio::task::spawn_blocking(move || match max_dimension {
        Some(limit) => codec::decode_thumbnail(&bytes, limit),
        None => codec::decode(&bytes),
    });
    match worker.await {
        Ok(decoded) => Ok(decoded.map_err(LoadError::Decode)?),
        Err(e) => Err(LoadError::Decode(DecodeError::Interrupted(e.to_string()))),
    }
}

/// Completion funnel: resolves every request on one task so deliveries
/// never interleave and never precede `load`'s return.
async fn run_delivery(mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        for waiter in delivery.waiters {
            let _ = waiter.send(delivery.result.clone());
        }
    }
    trace!("delivery funnel stopped");
}

/// React to memory-pressure events until the loader shuts down.
async fn run_pressure_listener(
    mut rx: broadcast::Receiver<()>,
    original: Arc<BoundedCache>,
    scaled: Arc<BoundedCache>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                trace!("memory-pressure listener stopped");
                break;
            }

            result = rx.recv() => {
                match result {
                    Ok(()) => {
                        info!("memory pressure received, flushing caches");
                        original.clear();
                        scaled.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        trace!("memory-pressure source dropped");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Missed events still mean pressure happened.
                        trace!(missed, "memory-pressure receiver lagged, flushing");
                        original.clear();
                        scaled.clear();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{BoxFuture, NetworkError};

    /// Client that fails every fetch; enough for tests that never need a
    /// successful load.
    struct FailingClient;

    impl NetworkClient for FailingClient {
        fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<bytes::Bytes, NetworkError>> {
            Box::pin(async { Err(NetworkError::Transport("unreachable".to_string())) })
        }
    }

    fn loader() -> ImageLoader {
        ImageLoader::new(
            Arc::new(FailingClient),
            LoaderConfig::default(),
            &MemoryPressureSource::new(),
        )
    }

    #[test]
    fn test_default_config_budget_split() {
        let config = LoaderConfig::default();
        assert!(config.original_cache.max_cost > config.scaled_cache.max_cost);
        assert!(config.scaled_cache.max_entries > config.original_cache.max_entries);
        assert_eq!(config.device_scale, 1.0);
    }

    #[tokio::test]
    async fn test_failed_fetch_delivers_none() {
        let loader = loader();
        let request = loader.load("https://x/a.png", None);
        assert!(request.bitmap().await.is_none());
        assert_eq!(loader.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_flush_clears_both_tiers() {
        let loader = loader();
        let image = Arc::new(DynamicImage::new_rgb8(2, 2));
        loader.original_cache().insert(
            ImageKey::Original {
                url: "https://x/a.png".to_string(),
            },
            Arc::clone(&image),
            12,
        );
        loader.scaled_cache().insert(
            ImageKey::for_request("https://x/a.png", Some(TargetSize::new(2.0, 2.0)), 1.0),
            image,
            12,
        );

        loader.flush();

        assert!(loader.original_cache().is_empty());
        assert!(loader.scaled_cache().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_request_is_noop() {
        let loader = loader();
        let request = loader.load("https://x/a.png", None);
        let token = request.token();
        assert!(request.bitmap().await.is_none());

        // Request already settled; both cancels hit absent registry keys.
        loader.cancel("https://x/a.png", None, token);
        loader.cancel("https://x/other.png", None, token);
    }

    #[tokio::test]
    async fn test_load_returns_before_delivery() {
        let loader = loader();
        let request = loader.load("https://x/a.png", None);
        // The request handle exists before any completion can have fired;
        // consuming it afterwards still yields the single delivery.
        assert!(request.bitmap().await.is_none());
    }
}
