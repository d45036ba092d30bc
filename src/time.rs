//! Wall-clock primitives.
//!
//! Request expiry and catalog timestamps use wall time (milliseconds since
//! the Unix epoch). Poll scheduling uses monotonic `Instant`s and never
//! wall time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Wall-clock timestamp in milliseconds since the Unix epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WallTime(pub u64);

impl WallTime {
    /// The Unix epoch itself. Cancellation expires requests "at the epoch",
    /// which is always in the past.
    pub const EPOCH: WallTime = WallTime(0);

    pub fn saturating_add(self, d: Duration) -> WallTime {
        WallTime(self.0.saturating_add(d.as_millis() as u64))
    }
}

/// Source of wall time. Injected so tests can control expiry.
pub trait WallClockSource: Send + Sync {
    fn now_ms(&self) -> u64;

    fn now(&self) -> WallTime {
        WallTime(self.now_ms())
    }
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemWallClock;

impl WallClockSource for SystemWallClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
