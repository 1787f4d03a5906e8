//! Run and event history, one text file per UTC day under `logs/`.
//!
//! Record formats (one JSON array per line, CRLF-terminated):
//!
//! - station run: `[pid,sid,duration,endtime]` with a trailing `%5.2f`
//!   gallons-per-minute field when a flow sensor is fitted
//! - event: `[value,"type",aux,timestamp]` where type is one of
//!   `s1 rd wl fl s2 cu`
//!
//! Writes open and close the file per record. A failed write evicts the
//! seven oldest log files and retries once; a second failure drops the
//! record.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::queue::LastRun;

/// Files evicted per reclaim pass (one week of daily logs).
const EVICT_BATCH: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogEvent {
    Sensor1 { active_secs: i64 },
    RainDelay { active_secs: i64 },
    WaterLevel { pct: u8 },
    FlowSession { pulses: u64, active_secs: i64 },
    Sensor2 { active_secs: i64 },
    /// Current-draw snapshot; only hardware with a sense resistor emits it.
    #[allow(dead_code)]
    Current { milliamps: u32 },
}

impl LogEvent {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Sensor1 { .. } => "s1",
            Self::RainDelay { .. } => "rd",
            Self::WaterLevel { .. } => "wl",
            Self::FlowSession { .. } => "fl",
            Self::Sensor2 { .. } => "s2",
            Self::Current { .. } => "cu",
        }
    }

    fn value(&self) -> u64 {
        match self {
            Self::FlowSession { pulses, .. } => *pulses,
            _ => 0,
        }
    }

    fn aux(&self) -> u64 {
        match self {
            Self::Sensor1 { active_secs }
            | Self::Sensor2 { active_secs }
            | Self::RainDelay { active_secs }
            | Self::FlowSession { active_secs, .. } => (*active_secs).max(0) as u64,
            Self::WaterLevel { pct } => u64::from(*pct),
            Self::Current { milliamps } => u64::from(*milliamps),
        }
    }
}

pub struct LogWriter {
    dir: PathBuf,
    pub enabled: bool,
}

impl LogWriter {
    pub fn new(data_dir: &Path, enabled: bool) -> Self {
        Self {
            dir: data_dir.join("logs"),
            enabled,
        }
    }

    /// Append a completed station run.
    pub fn write_station_run(&self, run: &LastRun, gpm: Option<f32>) {
        let mut line = format!(
            "[{},{},{},{}",
            run.pid, run.sid, run.duration, run.end_time
        );
        if let Some(gpm) = gpm {
            line.push_str(&format!(",{gpm:5.2}"));
        }
        line.push_str("]\r\n");
        self.append(run.end_time, &line);
    }

    /// Append a controller event.
    pub fn write_event(&self, event: LogEvent, timestamp: i64) {
        let line = format!(
            "[{},\"{}\",{},{}]\r\n",
            event.value(),
            event.type_name(),
            event.aux(),
            timestamp
        );
        self.append(timestamp, &line);
    }

    /// Delete one day's log by epoch-day name, or everything with "all".
    pub fn delete(&self, name: &str) {
        if !self.enabled {
            return;
        }
        if name == "all" {
            let _ = fs::remove_dir_all(&self.dir);
        } else {
            let _ = fs::remove_file(self.day_path(name));
        }
    }

    fn day_path(&self, day: &str) -> PathBuf {
        self.dir.join(format!("{day}.txt"))
    }

    fn append(&self, timestamp: i64, line: &str) {
        if !self.enabled {
            return;
        }
        let day = timestamp.div_euclid(86_400).to_string();
        let path = self.day_path(&day);

        if let Err(first) = self.try_append(&path, line) {
            // Reclaim space and retry exactly once.
            warn!(path = %path.display(), error = %first, "log write failed, evicting oldest");
            self.evict_oldest(EVICT_BATCH);
            if let Err(second) = self.try_append(&path, line) {
                warn!(path = %path.display(), error = %second, "log record dropped");
            }
        }
    }

    fn try_append(&self, path: &Path, line: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())
    }

    fn evict_oldest(&self, count: usize) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if !path.is_file() {
                    return None;
                }
                let meta = e.metadata().ok()?;
                let stamp = meta.created().or_else(|_| meta.modified()).ok()?;
                Some((stamp, path))
            })
            .collect();
        files.sort();
        for (_, path) in files.into_iter().take(count) {
            debug!(path = %path.display(), "evicting log file");
            let _ = fs::remove_file(path);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
