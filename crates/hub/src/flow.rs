//! Pulse-type flow sensor sampler.
//!
//! Polled once per millisecond while a flow sensor is configured; a pulse is
//! counted on the falling edge only. The sampler keeps a lifetime pulse
//! counter, a per-run gallon count that only starts accumulating after a
//! 90-second settling window, and an instantaneous rate derived from an
//! exponential moving average of the pulse period (alpha = 0.2).

use crate::clock::ms_since;

/// Window (seconds) the instantaneous rate is scaled by.
const FLOWCOUNT_RT_WINDOW: u32 = 30;

/// Settling window after the first pulse of a run, in milliseconds.
const SETTLE_MS: u32 = 90_000;

#[derive(Default)]
pub struct FlowSensor {
    /// Lifetime pulse counter, never reset.
    pub count: u64,
    /// Instantaneous rate, scaled by `FLOWCOUNT_RT_WINDOW` (pulses per
    /// window). Zero when flow has timed out.
    pub rate: u32,
    /// Gallons-per-minute of the last completed run.
    pub last_gpm: f32,

    prev_level: Option<bool>,
    last_poll_ms: Option<u32>,

    // Per-run measurement window.
    start_ms: Option<u32>, // first pulse of the run
    begin_ms: u32,         // first pulse after settling
    stop_ms: u32,          // most recent pulse
    gallons: u64,

    // Rate estimation.
    ema_period_ms: Option<u32>,
    last_edge_ms: u32,
    rate_reset_ms: Option<u32>,
}

impl FlowSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulses accumulated for the current run, after settling.
    pub fn gallons(&self) -> u64 {
        self.gallons
    }

    /// Reset the per-run window. Called whenever a station opens.
    pub fn begin_run(&mut self) {
        self.start_ms = None;
        self.gallons = 0;
    }

    /// Close out the measurement window and compute the average rate of the
    /// finished run. One pulse per gallon; the first accumulated gallon only
    /// anchors the window, so the average is taken over `gallons - 1`.
    pub fn end_run(&mut self) -> f32 {
        self.last_gpm = if self.gallons > 1 {
            let span = ms_since(self.stop_ms, self.begin_ms);
            if span == 0 {
                0.0
            } else {
                60_000.0 / (span as f32 / (self.gallons - 1) as f32)
            }
        } else {
            0.0
        };
        self.last_gpm
    }

    /// Sample the sensor pin. Re-entry within the same millisecond is
    /// ignored so the rate math never sees a zero period.
    pub fn poll(&mut self, now_ms: u32, level_high: bool) {
        if self.last_poll_ms == Some(now_ms) {
            return;
        }
        self.last_poll_ms = Some(now_ms);

        // Rate timeout: no pulse within 10x the last period clears the
        // instantaneous rate and re-arms first-pulse seeding.
        if let Some(reset) = self.rate_reset_ms {
            if ms_since(now_ms, reset) < u32::MAX / 2 && now_ms != reset {
                self.rate = 0;
                self.ema_period_ms = None;
                self.rate_reset_ms = None;
            }
        }
        if self.ema_period_ms.is_none() {
            self.last_edge_ms = now_ms;
        }

        // Falling edge only.
        let prev = self.prev_level.replace(level_high);
        if prev != Some(true) || level_high {
            return;
        }

        self.count += 1;

        if self.start_ms.is_none() {
            self.start_ms = Some(now_ms);
            self.gallons = 0;
        }
        let start = self.start_ms.unwrap_or(now_ms);
        if ms_since(now_ms, start) < SETTLE_MS {
            self.gallons = 0;
        } else {
            if self.gallons == 0 {
                // First pulse past the settling window anchors the window.
                self.begin_ms = now_ms;
            }
            self.gallons += 1;
        }

        let period = ms_since(now_ms, self.last_edge_ms);
        let ema = match self.ema_period_ms {
            // A zero stored period means the estimator is not yet seeded.
            Some(p) if p > 0 => period / 5 + p * 4 / 5,
            _ => period,
        };
        self.ema_period_ms = Some(ema);

        if ema > 0 {
            self.rate = FLOWCOUNT_RT_WINDOW * 1000 / ema;
            self.rate_reset_ms = Some(now_ms.wrapping_add(period.saturating_mul(10)));
        } else {
            self.rate = 0;
            self.rate_reset_ms = None;
        }

        self.last_edge_ms = now_ms;
        self.stop_ms = now_ms;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive one full pulse (high then low) at the given time.
    fn pulse(f: &mut FlowSensor, at_ms: u32) {
        f.poll(at_ms, true);
        f.poll(at_ms + 1, false);
    }

    // -- Edge detection -----------------------------------------------------

    #[test]
    fn counts_falling_edges_only() {
        let mut f = FlowSensor::new();
        f.begin_run();
        f.poll(10, true);
        f.poll(11, true);
        f.poll(12, false); // falling edge
        f.poll(13, false);
        f.poll(14, true);
        f.poll(15, false); // falling edge
        assert_eq!(f.count, 2);
    }

    #[test]
    fn same_millisecond_reentry_ignored() {
        let mut f = FlowSensor::new();
        f.begin_run();
        f.poll(10, true);
        f.poll(11, false);
        f.poll(11, true); // same ms, dropped
        f.poll(12, false); // no high seen, no edge
        assert_eq!(f.count, 1);
    }

    // -- Settling window ----------------------------------------------------

    #[test]
    fn gallons_stay_zero_through_settling_window() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        while t < 1000 + 89_500 {
            pulse(&mut f, t);
            t += 500;
        }
        assert_eq!(f.gallons(), 0);
        assert!(f.count > 0);
    }

    #[test]
    fn gallons_accumulate_after_settling() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        for _ in 0..200 {
            pulse(&mut f, t);
            t += 500;
        }
        // 200 pulses over 99.5 s; the first 90 s settle.
        assert!(f.gallons() > 0);
        assert!(f.gallons() < 25);
    }

    // -- Run average --------------------------------------------------------

    #[test]
    fn steady_half_second_pulses_average_120_gpm() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        // Pulse every 500 ms until 10 gallons have accumulated post-settle.
        while f.gallons() < 10 {
            pulse(&mut f, t);
            t += 500;
        }
        let gpm = f.end_run();
        assert!((gpm - 120.0).abs() < 0.5, "gpm = {gpm}");
    }

    #[test]
    fn single_gallon_reports_zero_gpm() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        while f.gallons() < 1 {
            pulse(&mut f, t);
            t += 500;
        }
        assert_eq!(f.end_run(), 0.0);
    }

    #[test]
    fn begin_run_resets_measurement_window() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        while f.gallons() < 5 {
            pulse(&mut f, t);
            t += 500;
        }
        let lifetime = f.count;
        f.begin_run();
        assert_eq!(f.gallons(), 0);
        // Lifetime counter is never reset.
        assert_eq!(f.count, lifetime);
    }

    // -- Rate estimation ----------------------------------------------------

    #[test]
    fn rate_tracks_pulse_period() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        for _ in 0..50 {
            pulse(&mut f, t);
            t += 500;
        }
        // Period converges to ~500 ms; rate = 30_000 / period.
        assert!(f.rate >= 55 && f.rate <= 65, "rate = {}", f.rate);
    }

    #[test]
    fn rate_ema_moves_at_most_one_fifth_toward_sample() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        for _ in 0..50 {
            pulse(&mut f, t);
            t += 500;
        }
        let before = f.rate;
        // One much slower pulse: the EMA absorbs only a fifth of it.
        t += 1500;
        pulse(&mut f, t);
        let after = f.rate;
        // period went 500 -> 500*4/5 + 2000/5 = 800; rate 60 -> 37
        assert!(after < before);
        assert!(after >= 30, "rate collapsed too fast: {after}");
    }

    #[test]
    fn rate_clears_after_timeout() {
        let mut f = FlowSensor::new();
        f.begin_run();
        let mut t = 1000;
        for _ in 0..10 {
            pulse(&mut f, t);
            t += 500;
        }
        assert!(f.rate > 0);
        // No pulses for far longer than 10x the period; next poll times out.
        t += 60_000;
        f.poll(t, true);
        assert_eq!(f.rate, 0);
    }
}
