//! Wall-clock seam.
//!
//! Timestamps in the entry table come from a pluggable clock so the engine
//! stays deterministic under test, and so the clock-bootstrap step at mount
//! (pushing the newest stored timestamp into a clockless device's idea of
//! now) can be modelled on the host without touching the machine clock.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Walltime before this is treated as "host clock unset" at mount
/// (1990-01-01T00:00:00Z).
pub const CLOCK_SENTINEL: u32 = 631_152_000;

pub trait WallClock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> u32;

    /// Push a known-good walltime into the clock.
    fn set(&self, secs: u32);
}

/// System time plus a settable offset. `set` adjusts the offset rather than
/// the machine clock.
#[derive(Default)]
pub struct SystemClock {
    offset: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn real_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

impl WallClock for SystemClock {
    fn now(&self) -> u32 {
        (Self::real_now() + self.offset.load(Ordering::Relaxed)).clamp(0, u32::MAX as i64) as u32
    }

    fn set(&self, secs: u32) {
        self.offset
            .store(secs as i64 - Self::real_now(), Ordering::Relaxed);
    }
}

/// Deterministic clock for tests.
pub struct FixedClock {
    now: AtomicU32,
}

impl FixedClock {
    pub fn new(now: u32) -> Self {
        Self {
            now: AtomicU32::new(now),
        }
    }
}

impl WallClock for FixedClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }

    fn set(&self, secs: u32) {
        self.now.store(secs, Ordering::Relaxed);
    }
}
