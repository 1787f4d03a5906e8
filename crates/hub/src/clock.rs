//! Time sources: TZ-adjusted wall-clock seconds for scheduling, monotonic
//! milliseconds for polling cadences.
//!
//! The two must never be mixed. Wall-clock seconds are compared directly;
//! monotonic milliseconds wrap at `u32::MAX` and are only ever compared via
//! [`ms_since`], which is wrap-safe.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;

pub trait Clock {
    /// Monotonic milliseconds. Wraps; compare with [`ms_since`] only.
    fn now_ms(&self) -> u32;
    /// Seconds of the TZ-adjusted wall clock.
    fn now_tz(&self) -> i64;
}

/// Milliseconds elapsed from `earlier` to `now`, tolerating wrap.
pub fn ms_since(now: u32, earlier: u32) -> u32 {
    now.wrapping_sub(earlier)
}

// ---------------------------------------------------------------------------
// Real clock
// ---------------------------------------------------------------------------

pub struct SystemClock {
    started: Instant,
    tz_offset_secs: i64,
}

impl SystemClock {
    pub fn new(tz_offset_minutes: i32) -> Self {
        Self {
            started: Instant::now(),
            tz_offset_secs: i64::from(tz_offset_minutes) * 60,
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap behaviour we want.
        self.started.elapsed().as_millis() as u32
    }

    fn now_tz(&self) -> i64 {
        Utc::now().timestamp() + self.tz_offset_secs
    }
}

// ---------------------------------------------------------------------------
// Test clock with controllable time
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeNow>>,
}

struct FakeNow {
    ms: u32,
    tz: i64,
}

impl FakeClock {
    pub fn new(ms: u32, tz: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeNow { ms, tz })),
        }
    }

    /// Advance only the monotonic clock.
    pub fn advance_ms(&self, ms: u32) {
        let mut now = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        now.ms = now.ms.wrapping_add(ms);
    }

    /// Advance both clocks together by whole seconds.
    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        now.tz += secs;
        now.ms = now.ms.wrapping_add((secs as u32).wrapping_mul(1000));
    }

    pub fn set_tz(&self, tz: i64) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tz = tz;
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).ms
    }

    fn now_tz(&self) -> i64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tz
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_since_simple() {
        assert_eq!(ms_since(1500, 1000), 500);
    }

    #[test]
    fn ms_since_across_wrap() {
        // 10 ms before wrap to 20 ms after wrap is 30 ms.
        assert_eq!(ms_since(20, u32::MAX - 9), 30);
    }

    #[test]
    fn fake_clock_advances_both() {
        let clk = FakeClock::new(100, 1_000_000);
        clk.advance_secs(5);
        assert_eq!(clk.now_ms(), 5100);
        assert_eq!(clk.now_tz(), 1_000_005);
    }

    #[test]
    fn fake_clock_advance_ms_leaves_wall_clock() {
        let clk = FakeClock::new(0, 42);
        clk.advance_ms(999);
        assert_eq!(clk.now_ms(), 999);
        assert_eq!(clk.now_tz(), 42);
    }

    #[test]
    fn system_clock_applies_tz_offset() {
        let utc = SystemClock::new(0);
        let west = SystemClock::new(-420); // UTC-7
        // The two readings may straddle a second boundary.
        let diff = utc.now_tz() - west.now_tz();
        assert!((diff - 420 * 60).abs() <= 1, "diff = {diff}");
    }
}
