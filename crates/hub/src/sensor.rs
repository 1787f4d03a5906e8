//! Binary sensor conditioning: rain/soil debounce with configurable on/off
//! delays, and the program-switch noise filter.

/// Minimum debounce delay in seconds, applied even when the configured
/// delay is zero.
const MIN_DELAY_SECS: i64 = 5;

// ---------------------------------------------------------------------------
// Rain / soil sensor debounce
// ---------------------------------------------------------------------------

/// Debounces a raw contact into an `active` level. The raw level must hold
/// for the configured delay before the debounced state follows it; each
/// direction has its own timer and arming one disarms the other.
pub struct DebouncedSensor {
    on_delay_secs: i64,
    off_delay_secs: i64,
    on_timer: i64,
    off_timer: i64,
    pub active: bool,
}

impl DebouncedSensor {
    pub fn new(on_delay_minutes: u8, off_delay_minutes: u8) -> Self {
        Self {
            on_delay_secs: (i64::from(on_delay_minutes) * 60).max(MIN_DELAY_SECS),
            off_delay_secs: (i64::from(off_delay_minutes) * 60).max(MIN_DELAY_SECS),
            on_timer: 0,
            off_timer: 0,
            active: false,
        }
    }

    /// Feed one per-second sample of the raw (already polarity-corrected)
    /// contact state.
    pub fn update(&mut self, now: i64, raw_active: bool) {
        if raw_active {
            if self.on_timer == 0 {
                self.on_timer = now + self.on_delay_secs;
                self.off_timer = 0;
            } else if now > self.on_timer {
                self.active = true;
            }
        } else if self.off_timer == 0 {
            self.off_timer = now + self.off_delay_secs;
            self.on_timer = 0;
        } else if now > self.off_timer {
            self.active = false;
        }
    }

    pub fn reset(&mut self) {
        self.on_timer = 0;
        self.off_timer = 0;
        self.active = false;
    }
}

// ---------------------------------------------------------------------------
// Program switch
// ---------------------------------------------------------------------------

/// Noise filter for a momentary program-start switch: an 8-bit history of
/// per-second samples, triggering once on two consecutive lows followed by
/// two consecutive highs.
#[derive(Default)]
pub struct ProgramSwitch {
    history: u8,
}

impl ProgramSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift in one sample; returns `true` on a debounced press.
    pub fn update(&mut self, pressed: bool) -> bool {
        self.history = (self.history << 1) | u8::from(pressed);
        self.history & 0b1111 == 0b0011
    }
}

// ===========================================================================
// Tests
// ===========================================================================
