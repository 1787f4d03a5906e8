//! Watering programs: day schedules, start times, per-station durations.
//!
//! A program fires when its day schedule matches the current day and one of
//! its start times lands on the current minute. Start-time granularity is
//! one minute; duration granularity is one second.

use chrono::{DateTime, Datelike};

/// Duration code: sunset minus sunrise.
pub const DUR_SUNRISE_TO_SUNSET: u16 = 65534;
/// Duration code: sunrise (next day) minus sunset.
pub const DUR_SUNSET_TO_SUNRISE: u16 = 65535;

// ---------------------------------------------------------------------------
// Schedule model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaySchedule {
    /// Weekday bitmask, bit 0 = Monday.
    Weekly { days: u8 },
    /// Fires when `epoch_day % interval == remainder`.
    Interval { interval: u16, remainder: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayRestriction {
    #[default]
    None,
    /// Odd calendar days only; the 31st and Feb 29 never match.
    Odd,
    /// Even calendar days only.
    Even,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartTimes {
    /// Up to four fixed minutes-of-day.
    Fixed(Vec<u16>),
    /// `start + k * interval` for `k < count`.
    Repeating { start: u16, interval: u16, count: u16 },
}

#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub enabled: bool,
    pub use_weather: bool,
    pub schedule: DaySchedule,
    pub restriction: DayRestriction,
    pub starts: StartTimes,
    /// Raw seconds per station, possibly a sunrise/sunset code. Indexed by
    /// sid; stations beyond the vector get zero.
    pub durations: Vec<u16>,
    /// Delete the program after its final start of a matching day.
    pub run_once: bool,
}

/// Outcome of a per-minute match query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    /// 1-based index of the start time that fired.
    pub runcount: u8,
    /// This was the last start of a run-once program's day.
    pub will_delete: bool,
}

impl Program {
    pub fn duration_for(&self, sid: usize) -> u16 {
        self.durations.get(sid).copied().unwrap_or(0)
    }

    /// Does this program fire on the minute containing `now_tz`?
    pub fn check_match(&self, now_tz: i64) -> Option<MatchResult> {
        if !self.enabled {
            return None;
        }
        if !self.day_matches(now_tz) {
            return None;
        }

        let minute = ((now_tz % 86_400) / 60) as u16;
        let (runcount, is_last) = match &self.starts {
            StartTimes::Fixed(starts) => {
                let idx = starts.iter().position(|&s| s == minute)?;
                let last = starts.iter().max().copied().unwrap_or(minute);
                ((idx + 1) as u8, minute == last)
            }
            StartTimes::Repeating {
                start,
                interval,
                count,
            } => {
                if minute < *start {
                    return None;
                }
                let offset = minute - start;
                if *interval == 0 {
                    if offset != 0 {
                        return None;
                    }
                    (1, true)
                } else {
                    if offset % interval != 0 {
                        return None;
                    }
                    let k = offset / interval;
                    if k >= *count {
                        return None;
                    }
                    ((k + 1) as u8, k + 1 == *count)
                }
            }
        };

        Some(MatchResult {
            runcount,
            will_delete: self.run_once && is_last,
        })
    }

    /// Station visit order for the `runcount`-th start of the day: the
    /// identity order rotated so repeated starts don't always water the same
    /// station first.
    pub fn gen_station_runorder(&self, runcount: u8, nstations: usize) -> Vec<usize> {
        if nstations == 0 {
            return Vec::new();
        }
        let shift = (runcount.max(1) as usize - 1) % nstations;
        (0..nstations).map(|i| (i + shift) % nstations).collect()
    }

    fn day_matches(&self, now_tz: i64) -> bool {
        let epoch_day = now_tz.div_euclid(86_400);
        let Some(date) = DateTime::from_timestamp(now_tz, 0) else {
            return false;
        };

        match self.restriction {
            DayRestriction::None => {}
            DayRestriction::Odd => {
                let dom = date.day();
                if dom % 2 == 0 || dom == 31 || (date.month() == 2 && dom == 29) {
                    return false;
                }
            }
            DayRestriction::Even => {
                if date.day() % 2 == 1 {
                    return false;
                }
            }
        }

        match &self.schedule {
            DaySchedule::Weekly { days } => {
                let weekday = date.weekday().num_days_from_monday() as u8;
                days & (1 << weekday) != 0
            }
            DaySchedule::Interval {
                interval,
                remainder,
            } => {
                if *interval == 0 {
                    return false;
                }
                epoch_day.rem_euclid(i64::from(*interval)) == i64::from(*remainder)
            }
        }
    }
}

/// Resolve a raw duration value into seconds, expanding sunrise/sunset
/// codes against the current solar times (minutes of day).
pub fn water_time_resolve(raw: u16, sunrise_minutes: u16, sunset_minutes: u16) -> i64 {
    match raw {
        DUR_SUNRISE_TO_SUNSET => {
            (i64::from(sunset_minutes) - i64::from(sunrise_minutes)).max(0) * 60
        }
        DUR_SUNSET_TO_SUNRISE => {
            (i64::from(sunrise_minutes) + 1440 - i64::from(sunset_minutes)).max(0) * 60
        }
        v => i64::from(v),
    }
}

// ---------------------------------------------------------------------------
// Special program commands
// ---------------------------------------------------------------------------

/// Commands carried in program names beginning with ':'. Unknown commands
/// are recognised as special but do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCommand {
    SafeReboot,
    RebootNow,
}

pub fn special_command(name: &str) -> Option<SpecialCommand> {
    if name.starts_with(":>reboot_now") {
        Some(SpecialCommand::RebootNow)
    } else if name.starts_with(":>reboot") {
        Some(SpecialCommand::SafeReboot)
    } else {
        None
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01 00:00:00 UTC was a Monday.
    const MONDAY_MIDNIGHT: i64 = 1_704_067_200;

    fn weekly_program(days: u8, starts: Vec<u16>) -> Program {
        Program {
            name: "Morning".into(),
            enabled: true,
            use_weather: false,
            schedule: DaySchedule::Weekly { days },
            restriction: DayRestriction::None,
            starts: StartTimes::Fixed(starts),
            durations: vec![600, 300],
            run_once: false,
        }
    }

    // -- Weekly matching ----------------------------------------------------

    #[test]
    fn fires_on_scheduled_weekday_and_minute() {
        let p = weekly_program(0b0000_0001, vec![360]); // Mondays, 06:00
        let at = MONDAY_MIDNIGHT + 360 * 60;
        assert_eq!(
            p.check_match(at),
            Some(MatchResult {
                runcount: 1,
                will_delete: false
            })
        );
    }

    #[test]
    fn skips_wrong_weekday() {
        let p = weekly_program(0b0000_0001, vec![360]);
        let tuesday = MONDAY_MIDNIGHT + 86_400 + 360 * 60;
        assert_eq!(p.check_match(tuesday), None);
    }

    #[test]
    fn skips_wrong_minute() {
        let p = weekly_program(0b0000_0001, vec![360]);
        assert_eq!(p.check_match(MONDAY_MIDNIGHT + 361 * 60), None);
    }

    #[test]
    fn disabled_program_never_fires() {
        let mut p = weekly_program(0x7F, vec![360]);
        p.enabled = false;
        assert_eq!(p.check_match(MONDAY_MIDNIGHT + 360 * 60), None);
    }

    #[test]
    fn second_fixed_start_reports_runcount_two() {
        let p = weekly_program(0x7F, vec![360, 480]);
        let m = p.check_match(MONDAY_MIDNIGHT + 480 * 60).unwrap();
        assert_eq!(m.runcount, 2);
    }

    // -- Interval-day matching ----------------------------------------------

    #[test]
    fn interval_day_uses_epoch_day_remainder() {
        let mut p = weekly_program(0, vec![0]);
        let epoch_day = MONDAY_MIDNIGHT / 86_400;
        p.schedule = DaySchedule::Interval {
            interval: 3,
            remainder: (epoch_day % 3) as u16,
        };
        assert!(p.check_match(MONDAY_MIDNIGHT).is_some());
        assert!(p.check_match(MONDAY_MIDNIGHT + 86_400).is_none());
        assert!(p.check_match(MONDAY_MIDNIGHT + 2 * 86_400).is_none());
        assert!(p.check_match(MONDAY_MIDNIGHT + 3 * 86_400).is_some());
    }

    // -- Odd/even restriction -----------------------------------------------

    #[test]
    fn odd_restriction_skips_even_days() {
        let mut p = weekly_program(0x7F, vec![0]);
        p.restriction = DayRestriction::Odd;
        // Jan 1 2024 is odd.
        assert!(p.check_match(MONDAY_MIDNIGHT).is_some());
        // Jan 2 is even.
        assert!(p.check_match(MONDAY_MIDNIGHT + 86_400).is_none());
    }

    #[test]
    fn odd_restriction_never_matches_the_31st() {
        let mut p = weekly_program(0x7F, vec![0]);
        p.restriction = DayRestriction::Odd;
        let jan31 = MONDAY_MIDNIGHT + 30 * 86_400;
        assert!(p.check_match(jan31).is_none());
    }

    // -- Repeating starts ---------------------------------------------------

    #[test]
    fn repeating_starts_fire_count_times() {
        let mut p = weekly_program(0x7F, vec![0]);
        p.starts = StartTimes::Repeating {
            start: 360,
            interval: 60,
            count: 3,
        };
        let base = MONDAY_MIDNIGHT;
        assert_eq!(p.check_match(base + 360 * 60).unwrap().runcount, 1);
        assert_eq!(p.check_match(base + 420 * 60).unwrap().runcount, 2);
        assert_eq!(p.check_match(base + 480 * 60).unwrap().runcount, 3);
        assert!(p.check_match(base + 540 * 60).is_none());
        assert!(p.check_match(base + 390 * 60).is_none());
    }

    #[test]
    fn run_once_deletes_after_final_start() {
        let mut p = weekly_program(0x7F, vec![360, 480]);
        p.run_once = true;
        assert!(!p.check_match(MONDAY_MIDNIGHT + 360 * 60).unwrap().will_delete);
        assert!(p.check_match(MONDAY_MIDNIGHT + 480 * 60).unwrap().will_delete);
    }

    // -- Run order ----------------------------------------------------------

    #[test]
    fn runorder_rotates_with_runcount() {
        let p = weekly_program(0x7F, vec![0]);
        assert_eq!(p.gen_station_runorder(1, 4), vec![0, 1, 2, 3]);
        assert_eq!(p.gen_station_runorder(2, 4), vec![1, 2, 3, 0]);
        assert_eq!(p.gen_station_runorder(3, 4), vec![2, 3, 0, 1]);
    }

    // -- Duration resolution ------------------------------------------------

    #[test]
    fn plain_durations_pass_through() {
        assert_eq!(water_time_resolve(600, 360, 1080), 600);
    }

    #[test]
    fn sunrise_to_sunset_code_resolves() {
        // 06:00 -> 18:00 is 12 h.
        assert_eq!(water_time_resolve(DUR_SUNRISE_TO_SUNSET, 360, 1080), 12 * 3600);
    }

    #[test]
    fn sunset_to_sunrise_code_resolves() {
        assert_eq!(water_time_resolve(DUR_SUNSET_TO_SUNRISE, 360, 1080), 12 * 3600);
    }

    // -- Special commands ---------------------------------------------------

    #[test]
    fn reboot_commands_parse() {
        assert_eq!(special_command(":>reboot"), Some(SpecialCommand::SafeReboot));
        assert_eq!(
            special_command(":>reboot_now"),
            Some(SpecialCommand::RebootNow)
        );
    }

    #[test]
    fn ordinary_names_are_not_special() {
        assert_eq!(special_command("Morning"), None);
        assert_eq!(special_command(":unknown"), None);
    }
}
