//! The controller: one owning aggregate for options, stations, programs,
//! the runtime queue, sensors, and valve bits, driven by a per-second tick.
//!
//! `poll` is called from the main loop as fast as once per millisecond; it
//! samples the flow sensor and runs the one-second control pass when the
//! wall clock advances. Within a tick the order is fixed: rain-delay and
//! sensor edges, program matching, station time-keeping, master handling,
//! pause countdown, dynamic overrides, valve latch, then the periodic
//! network/NTP/weather/reboot checks.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, Master, Options, SensorType, Station, NUM_MASTER_ZONES};
use crate::flow::FlowSensor;
use crate::hal::Gpio;
use crate::logger::{LogEvent, LogWriter};
use crate::notifier::{NotifQueue, Notification};
use crate::program::{water_time_resolve, Program};
use crate::queue::{QueueEntry, RuntimeQueue, PID_MANUAL, QID_NONE};
use crate::sensor::{DebouncedSensor, ProgramSwitch};

// Deliberately off-round intervals so periodic work spreads out instead of
// piling onto the same second.
pub const NTP_SYNC_INTERVAL: i64 = 86_413;
pub const CHECK_NETWORK_INTERVAL: i64 = 601;
pub const CHECK_WEATHER_TIMEOUT: i64 = 21_613;
pub const CHECK_WEATHER_SUCCESS_TIMEOUT: i64 = 86_400;

/// Seconds between a reboot command and the reboot itself.
pub(crate) const REBOOT_DELAY_SECS: i64 = 65;

/// Consecutive network-check failures that trigger a safe reboot.
const NETWORK_FAIL_LIMIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootCause {
    PowerOn,
    Timer,
    Program,
    NetworkFail,
}

impl RebootCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOn => "power_on",
            Self::Timer => "timer",
            Self::Program => "program",
            Self::NetworkFail => "network_fail",
        }
    }
}

#[derive(Default)]
pub struct Status {
    pub program_busy: bool,
    pub rain_delayed: bool,
    pub safe_reboot: bool,
    pub network_up: bool,
    pub network_fails: u8,
    pub req_ntpsync: bool,
    pub req_network: bool,
}

pub struct Controller {
    pub opts: Options,
    pub stations: Vec<Station>,
    pub programs: Vec<Program>,
    pub queue: RuntimeQueue,
    pub flow: FlowSensor,
    pub notif: NotifQueue,
    pub log: LogWriter,
    pub status: Status,
    pub reboot_timer: i64,

    /// Master assignments in effect; refreshed from options whenever the
    /// queue drains so mid-run edits don't strand an energised master.
    pub(crate) masters: [Option<Master>; NUM_MASTER_ZONES],
    pub(crate) station_bits: Vec<u8>,

    sensor1: DebouncedSensor,
    sensor2: DebouncedSensor,
    prev_sensor_active: [bool; 2],
    sensor_active_lasttime: [i64; 2],
    pswitch: [ProgramSwitch; 2],

    rain_delay_stop_time: i64,
    raindelay_on_lasttime: i64,
    prev_rain_delayed: bool,

    pub(crate) masters_last_on: [i64; NUM_MASTER_ZONES],
    pub(crate) flowcount_log_start: u64,
    pub(crate) flow_session_start: i64,

    reboot_cause: RebootCause,
    pending_reboot: Option<RebootCause>,

    checkwt_lasttime: i64,
    checkwt_success_lasttime: i64,
    weather_request: bool,
    ntp_request: bool,
    last_ntp_result: i64,

    last_second: i64,
    last_minute: i64,
    boot_notified: bool,
}

impl Controller {
    pub fn new(cfg: Config, data_dir: &Path) -> Self {
        let nstations = cfg.stations.len();
        let nbanks = nstations.div_ceil(8).max(1);
        let log = LogWriter::new(data_dir, cfg.options.enable_logging);
        Self {
            queue: RuntimeQueue::new(nstations),
            station_bits: vec![0; nbanks],
            sensor1: DebouncedSensor::new(
                cfg.options.sensor1.on_delay_minutes,
                cfg.options.sensor1.off_delay_minutes,
            ),
            sensor2: DebouncedSensor::new(
                cfg.options.sensor2.on_delay_minutes,
                cfg.options.sensor2.off_delay_minutes,
            ),
            prev_sensor_active: [false; 2],
            sensor_active_lasttime: [0; 2],
            pswitch: [ProgramSwitch::new(), ProgramSwitch::new()],
            rain_delay_stop_time: 0,
            raindelay_on_lasttime: 0,
            prev_rain_delayed: false,
            masters_last_on: [0; NUM_MASTER_ZONES],
            flowcount_log_start: 0,
            flow_session_start: 0,
            reboot_timer: 0,
            reboot_cause: RebootCause::PowerOn,
            pending_reboot: None,
            checkwt_lasttime: 0,
            checkwt_success_lasttime: 0,
            weather_request: false,
            ntp_request: false,
            last_ntp_result: 0,
            last_second: i64::MIN,
            last_minute: i64::MIN,
            boot_notified: false,
            masters: cfg.options.masters,
            flow: FlowSensor::new(),
            notif: NotifQueue::new(),
            log,
            status: Status::default(),
            opts: cfg.options,
            stations: cfg.stations,
            programs: cfg.programs,
        }
    }

    pub fn nstations(&self) -> usize {
        self.stations.len()
    }

    // -----------------------------------------------------------------
    // Station / master predicates
    // -----------------------------------------------------------------

    pub fn is_master_station(&self, sid: usize) -> bool {
        self.masters.iter().flatten().any(|m| m.sid == sid)
    }

    pub(crate) fn qid_for(&self, sid: usize) -> Option<usize> {
        let qid = *self.queue.station_qid.get(sid)?;
        (qid != QID_NONE).then_some(qid as usize)
    }

    // -----------------------------------------------------------------
    // Valve bits
    // -----------------------------------------------------------------

    pub fn is_running(&self, sid: usize) -> bool {
        self.station_bits
            .get(sid >> 3)
            .map(|b| (b >> (sid & 0x07)) & 1 == 1)
            .unwrap_or(false)
    }

    /// Returns whether the bit changed.
    pub(crate) fn set_station_bit(&mut self, sid: usize, on: bool) -> bool {
        let Some(bank) = self.station_bits.get_mut(sid >> 3) else {
            return false;
        };
        let mask = 1u8 << (sid & 0x07);
        let was_on = *bank & mask != 0;
        if on {
            *bank |= mask;
        } else {
            *bank &= !mask;
        }
        was_on != on
    }

    pub(crate) fn clear_all_station_bits(&mut self) {
        self.station_bits.fill(0);
    }

    pub(crate) fn apply_all_station_bits(&mut self, gpio: &mut impl Gpio) {
        gpio.apply_station_bits(&self.station_bits, self.stations.len());
    }

    // -----------------------------------------------------------------
    // Main entry points
    // -----------------------------------------------------------------

    /// Run one loop iteration: sample the flow sensor (millisecond-gated)
    /// and, when the wall clock has advanced, the one-second control pass.
    pub fn poll(&mut self, clock: &impl Clock, gpio: &mut impl Gpio) {
        if self.opts.sensor1.kind == SensorType::Flow {
            let level = gpio.digital_read(self.opts.sensor1.pin);
            self.flow.poll(clock.now_ms(), level);
        }

        let now = clock.now_tz();
        if now == self.last_second {
            return;
        }
        self.last_second = now;
        self.tick_second(now, gpio);
    }

    pub(crate) fn tick_second(&mut self, now: i64, gpio: &mut impl Gpio) {
        self.check_rain_delay(now);
        self.detect_sensors(now, gpio);
        self.check_program_switch(now, gpio);

        // Start-time granularity is one minute.
        let minute = now.div_euclid(60);
        if minute != self.last_minute {
            self.last_minute = minute;
            self.apply_monthly_adjustment(now);
            self.match_programs(now);
        }

        if self.status.program_busy {
            self.run_station_timekeeping(now, gpio);
        }

        self.update_master_bits(now);

        if self.queue.pause_state {
            if self.queue.pause_timer > 0 {
                self.queue.pause_timer -= 1;
            } else {
                self.clear_all_station_bits();
                self.queue.clear_pause();
            }
        }

        // Second override pass catches runs the master handling window
        // logic may have re-exposed this tick.
        self.process_dynamic_events(now);
        self.notify_master_edges(now);
        self.apply_all_station_bits(gpio);

        self.check_reboot(now);
        self.schedule_ntp_sync(now);
        self.schedule_network_check(now);
        self.check_weather(now);

        if !self.boot_notified {
            self.boot_notified = true;
            self.notif.add(Notification::Reboot {
                cause: self.reboot_cause.as_str(),
            });
        }
    }

    // -----------------------------------------------------------------
    // Rain delay
    // -----------------------------------------------------------------

    /// Arm a rain delay until `stop_time`; zero cancels.
    pub fn set_rain_delay(&mut self, stop_time: i64) {
        self.rain_delay_stop_time = stop_time;
    }

    fn check_rain_delay(&mut self, now: i64) {
        if self.status.rain_delayed {
            if now >= self.rain_delay_stop_time {
                self.status.rain_delayed = false;
                self.rain_delay_stop_time = 0;
            }
        } else if self.rain_delay_stop_time > now {
            self.status.rain_delayed = true;
        }

        if self.prev_rain_delayed != self.status.rain_delayed {
            if self.status.rain_delayed {
                self.raindelay_on_lasttime = now;
                info!("rain delay started");
                self.notif.add(Notification::RainDelay { active: true });
            } else {
                info!("rain delay ended");
                self.log.write_event(
                    LogEvent::RainDelay {
                        active_secs: (now - self.raindelay_on_lasttime).max(0),
                    },
                    now,
                );
                self.notif.add(Notification::RainDelay { active: false });
            }
            self.prev_rain_delayed = self.status.rain_delayed;
        }
    }

    // -----------------------------------------------------------------
    // Binary sensors + program switch
    // -----------------------------------------------------------------

    pub(crate) fn sensor_active(&self, index: usize) -> bool {
        match index {
            0 => self.opts.sensor1.kind.is_binary() && self.sensor1.active,
            1 => self.opts.sensor2.kind.is_binary() && self.sensor2.active,
            _ => false,
        }
    }

    fn detect_sensors(&mut self, now: i64, gpio: &mut impl Gpio) {
        for idx in 0..2 {
            let cfg = if idx == 0 {
                self.opts.sensor1
            } else {
                self.opts.sensor2
            };
            if !cfg.kind.is_binary() {
                continue;
            }
            let raw = gpio.digital_read(cfg.pin) == cfg.active_high;
            let sensor = if idx == 0 {
                &mut self.sensor1
            } else {
                &mut self.sensor2
            };
            sensor.update(now, raw);
            let active = sensor.active;

            if active != self.prev_sensor_active[idx] {
                let index = idx as u8 + 1;
                if active {
                    self.sensor_active_lasttime[idx] = now;
                    info!(sensor = index, "sensor activated");
                } else {
                    let active_secs = (now - self.sensor_active_lasttime[idx]).max(0);
                    info!(sensor = index, active_secs, "sensor cleared");
                    let event = if idx == 0 {
                        LogEvent::Sensor1 { active_secs }
                    } else {
                        LogEvent::Sensor2 { active_secs }
                    };
                    self.log.write_event(event, now);
                }
                self.notif.add(Notification::Sensor { index, active });
                self.prev_sensor_active[idx] = active;
            }
        }
    }

    fn check_program_switch(&mut self, now: i64, gpio: &mut impl Gpio) {
        let mut pressed = [false; 2];
        for idx in 0..2 {
            let cfg = if idx == 0 {
                self.opts.sensor1
            } else {
                self.opts.sensor2
            };
            if cfg.kind != SensorType::ProgramSwitch {
                continue;
            }
            let raw = gpio.digital_read(cfg.pin) == cfg.active_high;
            pressed[idx] = self.pswitch[idx].update(raw);
        }

        if pressed[0] || pressed[1] {
            self.reset_all_stations_immediate(gpio);
        }
        if pressed[0] && !self.programs.is_empty() {
            self.manual_start_program(now, 1, false, gpio);
        }
        if pressed[1] && self.programs.len() > 1 {
            self.manual_start_program(now, 2, false, gpio);
        }
    }

    // -----------------------------------------------------------------
    // Manual start / stop
    // -----------------------------------------------------------------

    /// Start a program by hand. `pid == 0` runs 60 s on every enabled
    /// station, `pid == 255` a 2 s test cycle; otherwise program `pid - 1`
    /// runs with its configured durations, scaled by the water percentage
    /// when `use_water_scale` is set.
    pub fn manual_start_program(
        &mut self,
        now: i64,
        pid: u8,
        use_water_scale: bool,
        gpio: &mut impl Gpio,
    ) {
        self.reset_all_stations_immediate(gpio);

        let prog = if pid > 0 && pid < 255 {
            match self.programs.get(pid as usize - 1).cloned() {
                Some(p) => {
                    self.notif.add(Notification::ProgramSched {
                        pid: pid - 1,
                        pct: if use_water_scale {
                            self.opts.water_percentage
                        } else {
                            100
                        },
                        manual: true,
                    });
                    Some(p)
                }
                None => {
                    warn!(pid, "manual start of unknown program ignored");
                    return;
                }
            }
        } else {
            None
        };

        let mut match_found = false;
        for sid in 0..self.stations.len() {
            if self.is_master_station(sid) {
                continue;
            }
            let mut dur: i64 = match (pid, &prog) {
                (255, _) => 2,
                (0, _) => 60,
                (_, Some(p)) => water_time_resolve(
                    p.duration_for(sid),
                    self.opts.sunrise_minutes,
                    self.opts.sunset_minutes,
                ),
                _ => 0,
            };
            if use_water_scale {
                dur = dur * i64::from(self.opts.water_percentage) / 100;
            }
            if dur > 0 && !self.stations[sid].disabled {
                let entry = QueueEntry {
                    sid,
                    pid: PID_MANUAL,
                    dur,
                    st: 0,
                    deque_time: 0,
                };
                if self.queue.enqueue(entry).is_some() {
                    match_found = true;
                }
            }
        }
        if match_found {
            self.schedule_all_stations(now);
        }
    }

    /// Cooperative stop: every queued run is tombstoned and drains through
    /// the next time-keeping pass, writing logs on the way out.
    pub fn reset_all_stations(&mut self) {
        for qid in 0..self.queue.len() {
            if let Some(e) = self.queue.get_mut(qid) {
                e.dur = 0;
            }
        }
    }

    /// Hard stop: valves off now, queue and pause cleared, no logs.
    pub fn reset_all_stations_immediate(&mut self, gpio: &mut impl Gpio) {
        self.clear_all_station_bits();
        self.apply_all_station_bits(gpio);
        self.queue.reset_runtime();
        self.status.program_busy = false;
        self.queue.clear_pause();
    }

    /// Pause the queue. Pending windows shift wholesale past the pause, a
    /// running window keeps only its unused remainder, and valves close
    /// until the countdown expires and actuation re-opens them.
    pub fn pause_queue(&mut self, now: i64, secs: i64) {
        self.queue.set_pause(secs);
        for qid in 0..self.queue.len() {
            let e = self.queue.entries()[qid];
            if e.dur == 0 || e.st == 0 || e.end() <= now {
                continue;
            }
            let lag = e.deque_time - e.end();
            let entry = self.queue.get_mut(qid).expect("index within bounds");
            if entry.st <= now {
                entry.dur = e.end() - now;
                entry.st = now + secs + 1;
            } else {
                entry.st += secs;
            }
            entry.deque_time = entry.st + entry.dur + lag;
        }
        self.clear_all_station_bits();
    }

    // -----------------------------------------------------------------
    // Reboot handling
    // -----------------------------------------------------------------

    pub(crate) fn request_safe_reboot(&mut self, cause: RebootCause, at: i64) {
        self.status.safe_reboot = true;
        self.reboot_cause = cause;
        self.reboot_timer = at;
    }

    fn check_reboot(&mut self, now: i64) {
        if self.status.safe_reboot && now > self.reboot_timer {
            if self.status.program_busy {
                return;
            }
            // Hold off while any program would fire within the next minute.
            let will_run = self
                .programs
                .iter()
                .any(|p| p.check_match(now + 60).is_some());
            if !will_run {
                self.reboot_dev(self.reboot_cause);
            }
        } else if self.reboot_timer != 0 && now > self.reboot_timer {
            self.reboot_dev(RebootCause::Timer);
        }
    }

    fn reboot_dev(&mut self, cause: RebootCause) {
        if self.pending_reboot.is_none() {
            warn!(cause = cause.as_str(), "reboot requested");
            self.pending_reboot = Some(cause);
        }
    }

    /// The main loop exits when this yields a cause.
    pub fn take_pending_reboot(&mut self) -> Option<RebootCause> {
        self.pending_reboot.take()
    }

    // -----------------------------------------------------------------
    // NTP
    // -----------------------------------------------------------------

    fn schedule_ntp_sync(&mut self, now: i64) {
        if now % NTP_SYNC_INTERVAL == 0 {
            self.status.req_ntpsync = true;
        }
        if !self.opts.enable_ntp || self.status.program_busy || !self.status.network_up {
            return;
        }
        if self.status.req_ntpsync {
            self.status.req_ntpsync = false;
            self.ntp_request = true;
        }
    }

    pub fn take_ntp_request(&mut self) -> bool {
        std::mem::take(&mut self.ntp_request)
    }

    /// Accept or reject an NTP result. A value within ±3 s of the previous
    /// accepted result is treated as a stuck upstream and rejected.
    pub fn apply_ntp_result(&mut self, t: i64) -> bool {
        if self.last_ntp_result > 3
            && t > self.last_ntp_result - 3
            && t < self.last_ntp_result + 3
        {
            debug!(t, last = self.last_ntp_result, "ntp result too close to last, rejected");
            return false;
        }
        self.last_ntp_result = t;
        t > 0
    }

    // -----------------------------------------------------------------
    // Network monitoring
    // -----------------------------------------------------------------

    /// Connectivity signal from the transport (broker connection state).
    pub fn set_network(&mut self, up: bool) {
        if up && !self.status.network_up {
            debug!("network up");
        }
        self.status.network_up = up;
        if up {
            self.status.network_fails = 0;
        }
    }

    fn schedule_network_check(&mut self, now: i64) {
        if now > 0 && now % CHECK_NETWORK_INTERVAL == 0 {
            self.status.req_network = true;
        }
        if self.status.program_busy || !self.status.req_network {
            return;
        }
        self.status.req_network = false;

        if self.status.network_up {
            self.status.network_fails = 0;
            return;
        }
        if self.status.network_fails < NETWORK_FAIL_LIMIT {
            self.status.network_fails += 1;
        }
        warn!(fails = self.status.network_fails, "network check failed");
        if self.status.network_fails == NETWORK_FAIL_LIMIT && !self.status.safe_reboot {
            self.request_safe_reboot(RebootCause::NetworkFail, now);
        }
    }

    // -----------------------------------------------------------------
    // Weather / water percentage
    // -----------------------------------------------------------------

    fn apply_monthly_adjustment(&mut self, now: i64) {
        use crate::config::WeatherMethod;
        if self.opts.weather_method != WeatherMethod::Monthly {
            return;
        }
        use chrono::Datelike;
        let Some(date) = chrono::DateTime::from_timestamp(now, 0) else {
            return;
        };
        let pct = self.opts.monthly_scales[date.month0() as usize];
        if pct != self.opts.water_percentage {
            self.set_water_percentage(pct, now);
        }
    }

    fn check_weather(&mut self, now: i64) {
        if self.status.network_fails > 0 || self.opts.remote_extension {
            return;
        }
        if self.status.program_busy || !self.status.network_up {
            return;
        }

        if self.checkwt_success_lasttime != 0
            && now > self.checkwt_success_lasttime + CHECK_WEATHER_SUCCESS_TIMEOUT
        {
            // The weather service has gone quiet; fall back to full watering
            // unless the method is locally computed.
            self.checkwt_success_lasttime = 0;
            if !self.opts.weather_method.is_local() && self.opts.water_percentage != 100 {
                warn!("no weather update within a day, resetting water level to 100%");
                self.set_water_percentage(100, now);
            }
        } else if self.checkwt_lasttime == 0 || now > self.checkwt_lasttime + CHECK_WEATHER_TIMEOUT
        {
            self.checkwt_lasttime = now;
            self.weather_request = true;
        }
    }

    pub fn take_weather_request(&mut self) -> bool {
        std::mem::take(&mut self.weather_request)
    }

    /// Record a successful weather adjustment.
    pub fn apply_weather_result(&mut self, now: i64, pct: u8) {
        self.checkwt_success_lasttime = now;
        if pct <= 250 && pct != self.opts.water_percentage {
            self.set_water_percentage(pct, now);
        }
    }

    fn set_water_percentage(&mut self, pct: u8, now: i64) {
        info!(pct, "water percentage changed");
        self.opts.water_percentage = pct;
        self.log.write_event(LogEvent::WaterLevel { pct }, now);
        self.notif.add(Notification::WeatherUpdate { pct });
    }
}

// ===========================================================================
// Test support
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::clock::FakeClock;
    use crate::hal::MockGpio;

    const T0: i64 = 1_700_000_000;

    // -- Rain delay edges ---------------------------------------------------

    #[test]
    fn rain_delay_starts_and_stops_with_notifications() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.set_rain_delay(T0 + 10);
        run_secs(&mut c, &clock, &mut gpio, 1);
        assert!(c.status.rain_delayed);

        let mut saw_start = false;
        while let Some(n) = c.notif.pop() {
            if matches!(n, Notification::RainDelay { active: true }) {
                saw_start = true;
            }
        }
        assert!(saw_start);

        run_secs(&mut c, &clock, &mut gpio, 12);
        assert!(!c.status.rain_delayed);

        let mut saw_stop = false;
        while let Some(n) = c.notif.pop() {
            if matches!(n, Notification::RainDelay { active: false }) {
                saw_stop = true;
            }
        }
        assert!(saw_stop);
    }

    #[test]
    fn rain_delay_end_writes_log_record() {
        let (mut c, tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.set_rain_delay(T0 + 5);
        run_secs(&mut c, &clock, &mut gpio, 10);

        let day = (T0 + 6) / 86_400;
        let contents =
            std::fs::read_to_string(tmp.path().join(format!("logs/{day}.txt"))).unwrap();
        assert!(contents.contains("\"rd\""), "log was: {contents}");
    }

    // -- Busy flag tracks the queue -----------------------------------------

    #[test]
    fn program_busy_iff_queue_nonempty() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        assert!(!c.status.program_busy);
        c.manual_start_program(clock.now_tz(), 0, false, &mut gpio);
        assert!(c.status.program_busy);
        assert!(!c.queue.is_empty());

        // Four stations, 60 s each, sequential with 5 s delay; run well past
        // the end and check the invariant each second.
        for _ in 0..260 {
            clock.advance_secs(1);
            c.poll(&clock, &mut gpio);
            assert_eq!(
                c.status.program_busy,
                !c.queue.is_empty(),
                "busy flag diverged from queue state"
            );
        }
        assert!(!c.status.program_busy);
    }

    // -- Manual start -------------------------------------------------------

    #[test]
    fn manual_test_program_runs_every_station_for_60s() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.manual_start_program(clock.now_tz(), 0, false, &mut gpio);
        assert_eq!(c.queue.len(), 4);
        for e in c.queue.entries() {
            assert_eq!(e.dur, 60);
            assert_eq!(e.pid, PID_MANUAL);
            assert!(e.st > 0, "entry must be scheduled");
        }
    }

    #[test]
    fn manual_short_test_uses_two_seconds() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.manual_start_program(clock.now_tz(), 255, false, &mut gpio);
        assert!(c.queue.entries().iter().all(|e| e.dur == 2));
    }

    #[test]
    fn manual_start_skips_disabled_and_master_stations() {
        let (mut c, _tmp) = controller_from(
            r#"
[[masters]]
station = "pump"

[[stations]]
name = "pump"

[[stations]]
name = "a"

[[stations]]
name = "b"
disabled = true
"#,
        );
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.manual_start_program(clock.now_tz(), 0, false, &mut gpio);
        let sids: Vec<usize> = c.queue.entries().iter().map(|e| e.sid).collect();
        assert_eq!(sids, vec![1]);
    }

    #[test]
    fn manual_start_replaces_running_set() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.manual_start_program(clock.now_tz(), 0, false, &mut gpio);
        run_secs(&mut c, &clock, &mut gpio, 5);
        assert!(c.is_running(0));

        c.manual_start_program(clock.now_tz(), 255, false, &mut gpio);
        // The hard reset turned everything off before requeueing.
        assert!(!c.is_running(0));
        assert_eq!(c.queue.len(), 4);
    }

    // -- Cooperative reset --------------------------------------------------

    #[test]
    fn reset_all_stations_drains_via_tick_and_logs() {
        let (mut c, tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();

        c.manual_start_program(clock.now_tz(), 0, false, &mut gpio);
        run_secs(&mut c, &clock, &mut gpio, 5);
        assert!(c.is_running(0));

        c.reset_all_stations();
        run_secs(&mut c, &clock, &mut gpio, 2);
        assert!(c.queue.is_empty());
        assert!(!c.is_running(0));

        // The interrupted run was logged.
        let day = (T0 + 6) / 86_400;
        let contents =
            std::fs::read_to_string(tmp.path().join(format!("logs/{day}.txt"))).unwrap();
        assert!(!contents.is_empty());
    }

    // -- NTP anomaly rejection ----------------------------------------------

    #[test]
    fn ntp_rejects_result_close_to_last() {
        let (mut c, _tmp) = controller_from(BASIC);
        assert!(c.apply_ntp_result(T0));
        assert!(!c.apply_ntp_result(T0 + 2));
        assert!(!c.apply_ntp_result(T0 - 2));
        assert!(c.apply_ntp_result(T0 + 100));
    }

    // -- Network failure counter --------------------------------------------

    #[test]
    fn three_network_failures_raise_safe_reboot() {
        let (mut c, _tmp) = controller_from(BASIC);
        // Three failed checks while the network is down.
        for i in 0..3 {
            c.status.req_network = true;
            c.schedule_network_check(T0 + i);
        }
        assert_eq!(c.status.network_fails, 3);
        assert!(c.status.safe_reboot);
    }

    #[test]
    fn network_recovery_clears_failure_count() {
        let (mut c, _tmp) = controller_from(BASIC);
        c.status.req_network = true;
        c.schedule_network_check(T0);
        assert_eq!(c.status.network_fails, 1);
        c.set_network(true);
        assert_eq!(c.status.network_fails, 0);
    }

    // -- Weather gating -----------------------------------------------------

    #[test]
    fn weather_request_raised_when_due() {
        let (mut c, _tmp) = controller_from(BASIC);
        c.set_network(true);
        c.check_weather(T0);
        assert!(c.take_weather_request());
        // Not due again immediately.
        c.check_weather(T0 + 1);
        assert!(!c.take_weather_request());
        // Due again after the check interval.
        c.check_weather(T0 + CHECK_WEATHER_TIMEOUT + 1);
        assert!(c.take_weather_request());
    }

    #[test]
    fn weather_result_updates_percentage_and_logs() {
        let (mut c, _tmp) = controller_from(BASIC);
        c.apply_weather_result(T0, 73);
        assert_eq!(c.opts.water_percentage, 73);
        let mut saw = false;
        while let Some(n) = c.notif.pop() {
            if matches!(n, Notification::WeatherUpdate { pct: 73 }) {
                saw = true;
            }
        }
        assert!(saw);
    }

    #[test]
    fn stale_weather_resets_to_full_watering() {
        let (mut c, _tmp) = controller_from(
            r#"
[options]
weather_method = "zimmerman"

[[stations]]
name = "a"
"#,
        );
        c.set_network(true);
        c.apply_weather_result(T0, 50);
        assert_eq!(c.opts.water_percentage, 50);

        c.check_weather(T0 + CHECK_WEATHER_SUCCESS_TIMEOUT + 1);
        assert_eq!(c.opts.water_percentage, 100);
    }

    #[test]
    fn stale_weather_keeps_manual_percentage() {
        let (mut c, _tmp) = controller_from(BASIC); // manual method
        c.set_network(true);
        c.apply_weather_result(T0, 50);
        c.check_weather(T0 + CHECK_WEATHER_SUCCESS_TIMEOUT + 1);
        assert_eq!(c.opts.water_percentage, 50);
    }

    // -- Monthly adjustment -------------------------------------------------

    #[test]
    fn monthly_method_sets_percentage_from_table() {
        let (mut c, _tmp) = controller_from(
            r#"
[options]
weather_method = "monthly"
monthly_scales = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120]

[[stations]]
name = "a"
"#,
        );
        let clock = FakeClock::new(0, 1_704_067_200); // 2024-01-01
        let mut gpio = MockGpio::new();
        run_secs(&mut c, &clock, &mut gpio, 1);
        assert_eq!(c.opts.water_percentage, 10);
    }

    // -- Boot notification --------------------------------------------------

    #[test]
    fn first_tick_emits_reboot_notification() {
        let (mut c, _tmp) = controller_from(BASIC);
        let clock = FakeClock::new(0, T0);
        let mut gpio = MockGpio::new();
        run_secs(&mut c, &clock, &mut gpio, 1);

        let mut saw = false;
        while let Some(n) = c.notif.pop() {
            if matches!(n, Notification::Reboot { .. }) {
                saw = true;
            }
        }
        assert!(saw);
    }
}
