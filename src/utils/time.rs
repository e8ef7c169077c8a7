//! Timestamp utilities.
//!
//! Reputation records store wall-clock seconds as `u32`, matching the on-disk
//! snapshot format. The [`Clock`] trait lets tests drive time by hand.

use crate::error::constants;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Source of "now" in whole seconds since the Unix epoch
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_secs(&self) -> u32;
}

/// Current Unix time in seconds, saturating at `u32::MAX`.
///
/// A clock set before the epoch reads as zero.
pub fn unix_time_secs() -> u32 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs().min(u64::from(u32::MAX)) as u32,
        Err(e) => {
            warn!(behind_ms = e.duration().as_millis() as u64, "{}", constants::ERR_SYSTEM_TIME);
            0
        }
    }
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        unix_time_secs()
    }
}

/// Manually advanced clock for deterministic tests
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    pub fn set(&self, secs: u32) {
        self.now.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_secs(), 100);
        clock.advance(50);
        assert_eq!(clock.now_secs(), 150);
        clock.set(7);
        assert_eq!(clock.now_secs(), 7);
    }
}
