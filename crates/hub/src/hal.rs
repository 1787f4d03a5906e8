//! Hardware access behind a narrow interface: sensor pin reads and the
//! latched valve-bit write. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation records state for tests and logs
//! transitions.

#[cfg(feature = "gpio")]
use anyhow::{Context, Result};
#[cfg(feature = "gpio")]
use rppal::gpio::{InputPin, OutputPin};
#[cfg(feature = "gpio")]
use std::collections::HashMap;

pub trait Gpio {
    /// Sample a digital input pin. `true` = high.
    fn digital_read(&mut self, pin: u8) -> bool;

    /// Latch the packed valve bits (bit `sid & 7` of byte `sid >> 3`) onto
    /// the relay outputs in one pass.
    fn apply_station_bits(&mut self, bits: &[u8], nstations: usize);
}

// ---------------------------------------------------------------------------
// Real GPIO (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RpiGpio {
    outputs: Vec<OutputPin>, // indexed by sid
    inputs: HashMap<u8, InputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RpiGpio {
    pub fn new(station_pins: &[u8], sensor_pins: &[u8], active_low: bool) -> Result<Self> {
        let gpio = rppal::gpio::Gpio::new().context("failed to open gpio chip")?;

        let mut outputs = Vec::with_capacity(station_pins.len());
        for &pin_num in station_pins {
            let mut pin = gpio
                .get(pin_num)
                .with_context(|| format!("failed to claim relay pin {pin_num}"))?
                .into_output();
            // Fail-safe: ensure "OFF" at startup.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            outputs.push(pin);
        }

        let mut inputs = HashMap::new();
        for &pin_num in sensor_pins {
            let pin = gpio
                .get(pin_num)
                .with_context(|| format!("failed to claim sensor pin {pin_num}"))?
                .into_input_pullup();
            inputs.insert(pin_num, pin);
        }

        Ok(Self {
            outputs,
            inputs,
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl Gpio for RpiGpio {
    fn digital_read(&mut self, pin: u8) -> bool {
        match self.inputs.get(&pin) {
            Some(p) => p.is_high(),
            None => true, // unclaimed pin reads as pulled-up
        }
    }

    fn apply_station_bits(&mut self, bits: &[u8], nstations: usize) {
        for (sid, pin) in self.outputs.iter_mut().enumerate().take(nstations) {
            let on = (bits[sid >> 3] >> (sid & 0x07)) & 1 == 1;
            let high = on != self.active_low;
            if high {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock GPIO (development and tests, no hardware)
// ---------------------------------------------------------------------------

#[cfg(any(test, not(feature = "gpio")))]
#[derive(Default)]
pub struct MockGpio {
    /// Input pin levels, settable by tests. Unset pins read high (pulled up).
    levels: std::collections::HashMap<u8, bool>,
    /// Last latched valve-bit vector.
    pub applied: Vec<u8>,
    /// Number of latch writes performed.
    pub apply_count: u64,
}

#[cfg(any(test, not(feature = "gpio")))]
impl MockGpio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, pin: u8, high: bool) {
        self.levels.insert(pin, high);
    }

    /// Whether the last latched write left `sid` energised.
    pub fn station_on(&self, sid: usize) -> bool {
        self.applied
            .get(sid >> 3)
            .map(|b| (b >> (sid & 0x07)) & 1 == 1)
            .unwrap_or(false)
    }
}

#[cfg(any(test, not(feature = "gpio")))]
impl Gpio for MockGpio {
    fn digital_read(&mut self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(true)
    }

    fn apply_station_bits(&mut self, bits: &[u8], nstations: usize) {
        if self.applied != bits {
            tracing::debug!(?bits, nstations, "valve latch applied");
        }
        self.applied = bits.to_vec();
        self.apply_count += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
