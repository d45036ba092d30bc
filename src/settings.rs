//! Runtime-mutable registry settings.
//!
//! These behave like cluster settings: any caller may mutate them at any
//! time, and the poller reacts to interval changes on its next loop
//! iteration via the watcher channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam::channel::Sender;

use crate::error::Error;

/// Default rate at which each node polls the requests table.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default size of one bundle chunk row.
pub const DEFAULT_BUNDLE_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest accepted bundle chunk size.
pub const MIN_BUNDLE_CHUNK_SIZE: u64 = 16;

pub struct RegistrySettings {
    poll_interval_ms: AtomicU64,
    bundle_chunk_size: AtomicU64,
    poll_interval_watchers: Mutex<Vec<Sender<()>>>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrySettings {
    pub fn new() -> Self {
        Self {
            poll_interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL.as_millis() as u64),
            bundle_chunk_size: AtomicU64::new(DEFAULT_BUNDLE_CHUNK_SIZE),
            poll_interval_watchers: Mutex::new(Vec::new()),
        }
    }

    /// The current poll interval. Zero means polling is disabled and only
    /// gossip notifications drive reconciliation.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.poll_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        let watchers = self
            .poll_interval_watchers
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        for tx in watchers.iter() {
            // Watchers drain at their own pace; a full channel already
            // holds a wakeup.
            let _ = tx.try_send(());
        }
    }

    /// Registers a channel notified (without blocking) on every interval
    /// mutation.
    pub fn watch_poll_interval(&self, tx: Sender<()>) {
        self.poll_interval_watchers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(tx);
    }

    pub fn bundle_chunk_size(&self) -> u64 {
        self.bundle_chunk_size.load(Ordering::Relaxed)
    }

    /// Rejects sizes smaller than [`MIN_BUNDLE_CHUNK_SIZE`].
    pub fn set_bundle_chunk_size(&self, size: u64) -> Result<(), Error> {
        if size < MIN_BUNDLE_CHUNK_SIZE {
            return Err(Error::ChunkSizeTooSmall {
                got: size,
                min: MIN_BUNDLE_CHUNK_SIZE,
            });
        }
        self.bundle_chunk_size.store(size, Ordering::Relaxed);
        Ok(())
    }
}
