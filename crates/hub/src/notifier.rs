//! The MQTT surface: outbound event notifications and inbound control
//! commands.
//!
//! Core code appends events to a bounded in-memory queue; the main loop
//! drains it onto MQTT whenever the broker connection is up. Events raised
//! while offline wait in the queue (oldest dropped past the cap). Inbound
//! commands arrive on `sprinklerd/cmd/<verb>` with bare-number payloads.

use std::collections::VecDeque;

use serde_json::{json, Value};

/// Maximum queued notifications awaiting publish.
const MAX_PENDING: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A program produced queue entries; `pct` is the effective watering
    /// percentage, `manual` marks operator-started runs.
    ProgramSched { pid: u8, pct: u8, manual: bool },
    StationOn { sid: usize, duration: i64 },
    StationOff { sid: usize, duration: i64 },
    FlowAlert { sid: usize, gpm: f32 },
    RainDelay { active: bool },
    Sensor { index: u8, active: bool },
    WeatherUpdate { pct: u8 },
    /// Pulse count of a finished watering session.
    FlowSensor { pulses: u64 },
    Reboot { cause: &'static str },
}

impl Notification {
    /// MQTT topic suffix and JSON payload for this event.
    pub fn to_mqtt(&self) -> (&'static str, Value) {
        match self {
            Self::ProgramSched { pid, pct, manual } => (
                "program",
                json!({ "pid": pid, "water_pct": pct, "manual": manual }),
            ),
            Self::StationOn { sid, duration } => {
                ("station/on", json!({ "sid": sid, "duration": duration }))
            }
            Self::StationOff { sid, duration } => {
                ("station/off", json!({ "sid": sid, "duration": duration }))
            }
            Self::FlowAlert { sid, gpm } => ("flow/alert", json!({ "sid": sid, "gpm": gpm })),
            Self::RainDelay { active } => ("raindelay", json!({ "active": active })),
            Self::Sensor { index, active } => {
                ("sensor", json!({ "sensor": index, "active": active }))
            }
            Self::WeatherUpdate { pct } => ("weather", json!({ "water_pct": pct })),
            Self::FlowSensor { pulses } => ("flow/session", json!({ "pulses": pulses })),
            Self::Reboot { cause } => ("reboot", json!({ "cause": cause })),
        }
    }
}

#[derive(Default)]
pub struct NotifQueue {
    pending: VecDeque<Notification>,
}

impl NotifQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: Notification) {
        if self.pending.len() >= MAX_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Notification> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Inbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a program by hand: 0 = 60 s test, 255 = 2 s test, else pid.
    RunProgram { pid: u8 },
    /// Tombstone every queued run; logs are written as they drain.
    StopAll,
    /// Valves off immediately, no logs.
    StopAllNow,
    Pause { secs: i64 },
    /// Hours of rain delay; zero cancels.
    RainDelay { hours: i64 },
    WaterLevel { pct: u8 },
}

/// Extract the verb from "sprinklerd/cmd/<verb>".
pub fn command_verb(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "sprinklerd" && parts[1] == "cmd" {
        Some(parts[2])
    } else {
        None
    }
}

/// Parse a command payload (a bare decimal number where one is needed).
pub fn parse_command(verb: &str, payload: &[u8]) -> Result<Command, String> {
    let text = String::from_utf8_lossy(payload);
    let arg = text.trim();
    let number = |what: &str| -> Result<i64, String> {
        arg.parse::<i64>()
            .map_err(|_| format!("bad {what} '{arg}'"))
    };
    match verb {
        "run_program" => {
            let pid = number("program id")?;
            u8::try_from(pid)
                .map(|pid| Command::RunProgram { pid })
                .map_err(|_| format!("bad program id '{arg}'"))
        }
        "stop" => Ok(Command::StopAll),
        "stop_now" => Ok(Command::StopAllNow),
        "pause" => {
            let secs = number("pause length")?;
            if secs <= 0 {
                return Err(format!("bad pause length '{arg}'"));
            }
            Ok(Command::Pause { secs })
        }
        "rain_delay" => {
            let hours = number("rain delay")?;
            if !(0..=720).contains(&hours) {
                return Err(format!("rain delay out of range '{arg}'"));
            }
            Ok(Command::RainDelay { hours })
        }
        "water_level" => {
            let pct = number("water level")?;
            if !(0..=250).contains(&pct) {
                return Err(format!("water level out of range '{arg}'"));
            }
            Ok(Command::WaterLevel { pct: pct as u8 })
        }
        other => Err(format!("unknown command '{other}'")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
