//! TOML configuration: controller options, sensor wiring, master zones,
//! stations, and watering programs.
//!
//! The raw serde structures are validated and cross-referenced (masters and
//! program durations refer to stations by name) into the typed forms the
//! controller consumes.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::program::{DayRestriction, DaySchedule, Program, StartTimes};
use crate::queue::NUM_SEQ_GROUPS;

pub const MAX_STATIONS: usize = 64;
pub const NUM_MASTER_ZONES: usize = 2;

/// Master on/off adjustment bound, seconds.
const MAX_MASTER_ADJ_SECS: i16 = 600;

// ---------------------------------------------------------------------------
// Typed configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    None,
    Flow,
    Rain,
    Soil,
    ProgramSwitch,
}

impl SensorType {
    /// Rain and soil sensors share the binary debounce path.
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Rain | Self::Soil)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherMethod {
    Manual,
    Zimmerman,
    AutoRainDelay,
    Eto,
    Monthly,
}

impl WeatherMethod {
    /// Methods that never expire back to 100% on weather-service silence.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Manual | Self::AutoRainDelay | Self::Monthly)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SensorConfig {
    pub kind: SensorType,
    pub pin: u8,
    /// Contact level that counts as "activated".
    pub active_high: bool,
    pub on_delay_minutes: u8,
    pub off_delay_minutes: u8,
}

impl SensorConfig {
    pub fn disabled() -> Self {
        Self {
            kind: SensorType::None,
            pin: 0,
            active_high: false,
            on_delay_minutes: 0,
            off_delay_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Master {
    pub sid: usize,
    pub on_adjust_secs: i16,
    pub off_adjust_secs: i16,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub timezone_minutes: i32,
    pub enabled: bool,
    pub water_percentage: u8,
    /// Gap inserted between sequential runs; may be negative (overlap).
    pub station_delay: i16,
    pub remote_extension: bool,
    pub enable_logging: bool,
    pub enable_ntp: bool,
    pub weather_method: WeatherMethod,
    /// Per-month water percentage, applied when the method is `monthly`.
    pub monthly_scales: [u8; 12],
    pub sunrise_minutes: u16,
    pub sunset_minutes: u16,
    pub sensor1: SensorConfig,
    pub sensor2: SensorConfig,
    pub masters: [Option<Master>; NUM_MASTER_ZONES],
}

#[derive(Debug, Clone)]
pub struct Station {
    pub name: String,
    pub gpio_pin: Option<u8>,
    /// Sequential group; `None` runs concurrently.
    pub group: Option<u8>,
    pub disabled: bool,
    pub ignore_rain_delay: bool,
    pub ignore_sensor1: bool,
    pub ignore_sensor2: bool,
    pub use_master: [bool; NUM_MASTER_ZONES],
}

impl Station {
    pub fn is_sequential(&self) -> bool {
        self.group.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub options: Options,
    pub stations: Vec<Station>,
    pub programs: Vec<Program>,
}

// ---------------------------------------------------------------------------
// Raw file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    options: RawOptions,
    #[serde(default)]
    masters: Vec<RawMaster>,
    #[serde(default)]
    stations: Vec<RawStation>,
    #[serde(default)]
    programs: Vec<RawProgram>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawOptions {
    timezone_minutes: i32,
    enabled: bool,
    water_percentage: u8,
    station_delay: i16,
    remote_extension: bool,
    enable_logging: bool,
    enable_ntp: bool,
    weather_method: WeatherMethod,
    monthly_scales: Vec<u8>,
    sunrise_minutes: u16,
    sunset_minutes: u16,
    sensor1: Option<RawSensor>,
    sensor2: Option<RawSensor>,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            timezone_minutes: 0,
            enabled: true,
            water_percentage: 100,
            station_delay: 0,
            remote_extension: false,
            enable_logging: true,
            enable_ntp: true,
            weather_method: WeatherMethod::Manual,
            monthly_scales: vec![100; 12],
            sunrise_minutes: 360,
            sunset_minutes: 1080,
            sensor1: None,
            sensor2: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSensor {
    kind: SensorType,
    pin: u8,
    #[serde(default)]
    active_high: bool,
    #[serde(default)]
    on_delay_minutes: u8,
    #[serde(default)]
    off_delay_minutes: u8,
}

#[derive(Debug, Deserialize)]
struct RawMaster {
    station: String,
    #[serde(default)]
    on_adjust_secs: i16,
    #[serde(default)]
    off_adjust_secs: i16,
}

#[derive(Debug, Deserialize)]
struct RawStation {
    name: String,
    gpio_pin: Option<u8>,
    group: Option<u8>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    ignore_rain_delay: bool,
    #[serde(default)]
    ignore_sensor1: bool,
    #[serde(default)]
    ignore_sensor2: bool,
    #[serde(default)]
    use_master1: bool,
    #[serde(default)]
    use_master2: bool,
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    use_weather: bool,
    #[serde(default)]
    run_once: bool,
    /// Weekday names ("mon".."sun"); mutually exclusive with interval_days.
    days: Option<Vec<String>>,
    interval_days: Option<u16>,
    #[serde(default)]
    interval_remainder: u16,
    #[serde(default)]
    restriction: RawRestriction,
    /// Fixed start minutes-of-day; mutually exclusive with `repeat`.
    start_minutes: Option<Vec<u16>>,
    repeat: Option<RawRepeat>,
    /// Station name -> raw duration seconds (or sunrise/sunset code).
    #[serde(default)]
    durations: std::collections::BTreeMap<String, u16>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawRestriction {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Deserialize)]
struct RawRepeat {
    start: u16,
    interval: u16,
    count: u16,
}

// ---------------------------------------------------------------------------
// Load + validate
// ---------------------------------------------------------------------------

/// Read and validate a config file.
pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    parse(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

pub fn parse(contents: &str) -> Result<Config> {
    let raw: RawConfig = toml::from_str(contents)?;

    if raw.stations.len() > MAX_STATIONS {
        bail!("too many stations: {} (max {MAX_STATIONS})", raw.stations.len());
    }
    if raw.options.water_percentage > 250 {
        bail!("water_percentage out of range: {}", raw.options.water_percentage);
    }
    if raw.options.monthly_scales.len() != 12 {
        bail!("monthly_scales must have 12 entries");
    }
    // Program ids ride in a byte alongside the manual-start tags.
    if raw.programs.len() > 40 {
        bail!("too many programs: {} (max 40)", raw.programs.len());
    }

    let mut stations = Vec::with_capacity(raw.stations.len());
    for s in &raw.stations {
        if stations.iter().any(|p: &Station| p.name == s.name) {
            bail!("duplicate station name '{}'", s.name);
        }
        if let Some(g) = s.group {
            if usize::from(g) >= NUM_SEQ_GROUPS {
                bail!("station '{}' group {} out of range", s.name, g);
            }
        }
        stations.push(Station {
            name: s.name.clone(),
            gpio_pin: s.gpio_pin,
            group: s.group,
            disabled: s.disabled,
            ignore_rain_delay: s.ignore_rain_delay,
            ignore_sensor1: s.ignore_sensor1,
            ignore_sensor2: s.ignore_sensor2,
            use_master: [s.use_master1, s.use_master2],
        });
    }

    let sid_of = |name: &str| -> Result<usize> {
        stations
            .iter()
            .position(|s| s.name == name)
            .with_context(|| format!("unknown station '{name}'"))
    };

    if raw.masters.len() > NUM_MASTER_ZONES {
        bail!("at most {NUM_MASTER_ZONES} master zones are supported");
    }
    let mut masters = [None; NUM_MASTER_ZONES];
    for (i, m) in raw.masters.iter().enumerate() {
        if m.on_adjust_secs.abs() > MAX_MASTER_ADJ_SECS
            || m.off_adjust_secs.abs() > MAX_MASTER_ADJ_SECS
        {
            bail!("master '{}' adjustment exceeds ±{MAX_MASTER_ADJ_SECS}s", m.station);
        }
        masters[i] = Some(Master {
            sid: sid_of(&m.station)?,
            on_adjust_secs: m.on_adjust_secs,
            off_adjust_secs: m.off_adjust_secs,
        });
    }

    let mut programs = Vec::with_capacity(raw.programs.len());
    for p in &raw.programs {
        programs.push(convert_program(p, &stations, &sid_of)?);
    }

    let options = Options {
        timezone_minutes: raw.options.timezone_minutes,
        enabled: raw.options.enabled,
        water_percentage: raw.options.water_percentage,
        station_delay: raw.options.station_delay,
        remote_extension: raw.options.remote_extension,
        enable_logging: raw.options.enable_logging,
        enable_ntp: raw.options.enable_ntp,
        weather_method: raw.options.weather_method,
        monthly_scales: {
            let mut scales = [100u8; 12];
            scales.copy_from_slice(&raw.options.monthly_scales);
            scales
        },
        sunrise_minutes: raw.options.sunrise_minutes,
        sunset_minutes: raw.options.sunset_minutes,
        sensor1: convert_sensor(raw.options.sensor1.as_ref()),
        sensor2: convert_sensor(raw.options.sensor2.as_ref()),
        masters,
    };

    Ok(Config {
        options,
        stations,
        programs,
    })
}

fn convert_sensor(raw: Option<&RawSensor>) -> SensorConfig {
    match raw {
        Some(s) => SensorConfig {
            kind: s.kind,
            pin: s.pin,
            active_high: s.active_high,
            on_delay_minutes: s.on_delay_minutes,
            off_delay_minutes: s.off_delay_minutes,
        },
        None => SensorConfig::disabled(),
    }
}

fn convert_program(
    p: &RawProgram,
    stations: &[Station],
    sid_of: &dyn Fn(&str) -> Result<usize>,
) -> Result<Program> {
    let schedule = match (&p.days, p.interval_days) {
        (Some(_), Some(_)) => {
            bail!("program '{}': days and interval_days are mutually exclusive", p.name)
        }
        (Some(days), None) => DaySchedule::Weekly {
            days: weekday_mask(days)
                .with_context(|| format!("program '{}': bad weekday list", p.name))?,
        },
        (None, Some(interval)) => {
            if interval == 0 {
                bail!("program '{}': interval_days must be positive", p.name);
            }
            if p.interval_remainder >= interval {
                bail!("program '{}': interval_remainder must be below interval_days", p.name);
            }
            DaySchedule::Interval {
                interval,
                remainder: p.interval_remainder,
            }
        }
        (None, None) => bail!("program '{}': needs days or interval_days", p.name),
    };

    let starts = match (&p.start_minutes, &p.repeat) {
        (Some(_), Some(_)) => {
            bail!("program '{}': start_minutes and repeat are mutually exclusive", p.name)
        }
        (Some(mins), None) => {
            if mins.is_empty() || mins.len() > 4 {
                bail!("program '{}': 1 to 4 fixed start times", p.name);
            }
            if let Some(&bad) = mins.iter().find(|&&m| m >= 1440) {
                bail!("program '{}': start minute {bad} out of range", p.name);
            }
            StartTimes::Fixed(mins.clone())
        }
        (None, Some(r)) => {
            if r.start >= 1440 || r.count == 0 || r.count > 250 {
                bail!("program '{}': bad repeat specification", p.name);
            }
            StartTimes::Repeating {
                start: r.start,
                interval: r.interval,
                count: r.count,
            }
        }
        (None, None) => bail!("program '{}': needs start_minutes or repeat", p.name),
    };

    let mut durations = vec![0u16; stations.len()];
    for (station_name, &secs) in &p.durations {
        let sid = sid_of(station_name)
            .with_context(|| format!("program '{}': unknown duration target", p.name))?;
        durations[sid] = secs;
    }

    Ok(Program {
        name: p.name.clone(),
        enabled: p.enabled,
        use_weather: p.use_weather,
        schedule,
        restriction: match p.restriction {
            RawRestriction::None => DayRestriction::None,
            RawRestriction::Odd => DayRestriction::Odd,
            RawRestriction::Even => DayRestriction::Even,
        },
        starts,
        durations,
        run_once: p.run_once,
    })
}

fn weekday_mask(days: &[String]) -> Result<u8> {
    let mut mask = 0u8;
    for day in days {
        let bit = match day.to_ascii_lowercase().as_str() {
            "mon" => 0,
            "tue" => 1,
            "wed" => 2,
            "thu" => 3,
            "fri" => 4,
            "sat" => 5,
            "sun" => 6,
            other => bail!("unknown weekday '{other}'"),
        };
        mask |= 1 << bit;
    }
    Ok(mask)
}

// ===========================================================================
// Tests
// ===========================================================================
