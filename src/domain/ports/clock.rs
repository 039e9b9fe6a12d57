//! Clock port.
//!
//! Components never read time directly; they go through this seam so CI
//! runs get a deterministic clock and boot sequences replay identically.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic nanoseconds since an arbitrary process-local origin.
    fn monotonic_ns(&self) -> u64;
}

/// The real system clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Deterministic clock for CI mode.
///
/// Every read advances time by a fixed step, so two boots with identical
/// inputs observe identical timestamp sequences.
pub struct DeterministicClock {
    epoch: DateTime<Utc>,
    step_ns: u64,
    ticks: AtomicU64,
}

impl DeterministicClock {
    pub fn new(epoch: DateTime<Utc>, step_ns: u64) -> Self {
        Self {
            epoch,
            step_ns,
            ticks: AtomicU64::new(0),
        }
    }

    /// Fixed epoch (2026-01-01T00:00:00Z) advancing 1 ms per read.
    pub fn for_ci() -> Self {
        let epoch = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
        Self::new(epoch, 1_000_000)
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }
}

impl Clock for DeterministicClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let ns = self.tick() * self.step_ns;
        self.epoch + Duration::nanoseconds(ns as i64)
    }

    fn monotonic_ns(&self) -> u64 {
        self.tick() * self.step_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ns();
        let b = clock.monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_deterministic_clock_replays() {
        let a = DeterministicClock::for_ci();
        let b = DeterministicClock::for_ci();
        let seq_a: Vec<_> = (0..5).map(|_| a.now_utc()).collect();
        let seq_b: Vec<_> = (0..5).map(|_| b.now_utc()).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_deterministic_clock_advances() {
        let clock = DeterministicClock::for_ci();
        let t1 = clock.now_utc();
        let t2 = clock.now_utc();
        assert!(t2 > t1);
    }
}
