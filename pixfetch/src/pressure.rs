//! Process-wide memory-pressure signal.
//!
//! The hosting environment owns a [`MemoryPressureSource`] and calls
//! [`MemoryPressureSource::notify`] when the process should shed memory.
//! Subscribers receive a zero-payload event; delivery is asynchronous and
//! unordered with respect to other work.

use tokio::sync::broadcast;

/// Buffered pressure events per subscriber. A lagged subscriber reacts to
/// the fact of pressure, not to each individual event.
const CHANNEL_CAPACITY: usize = 16;

/// Broadcast handle for memory-pressure events.
///
/// Cloning shares the same underlying channel, so any clone can notify and
/// every subscriber sees every event.
#[derive(Debug, Clone)]
pub struct MemoryPressureSource {
    tx: broadcast::Sender<()>,
}

impl MemoryPressureSource {
    /// Creates a new pressure source with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Broadcasts a pressure event.
    ///
    /// Returns the number of subscribers that received it; zero when
    /// nothing is subscribed.
    pub fn notify(&self) -> usize {
        self.tx.send(()).unwrap_or(0)
    }

    /// Subscribes to pressure events.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for MemoryPressureSource {
    fn default() -> Self {
        Self::new()
    }
}
