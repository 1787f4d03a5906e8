//! Per-second station time-keeping: binding queue entries to stations,
//! opening and closing valves as their windows arrive, collecting spent
//! entries, dynamic-event overrides, and master-zone windows.

use tracing::info;

use crate::config::NUM_MASTER_ZONES;
use crate::controller::Controller;
use crate::hal::Gpio;
use crate::logger::LogEvent;
use crate::notifier::Notification;
use crate::queue::{LastRun, NUM_SEQ_GROUPS, PID_MANUAL_FLOOR, QID_NONE};

impl Controller {
    // -----------------------------------------------------------------
    // The per-second pass while a program is running
    // -----------------------------------------------------------------

    pub(crate) fn run_station_timekeeping(&mut self, now: i64, gpio: &mut impl Gpio) {
        // Bind queue entries to stations; the earliest start wins when a
        // station has more than one entry.
        for qid in 0..self.queue.len() {
            let e = self.queue.entries()[qid];
            let bound = self.queue.station_qid[e.sid];
            if bound != QID_NONE {
                if let Some(prev) = self.queue.get(bound as usize) {
                    if prev.st < e.st {
                        continue;
                    }
                }
            }
            self.queue.station_qid[e.sid] = qid as u8;
        }

        // Actuate: open stations whose window has arrived, close those
        // whose window has passed.
        for sid in 0..self.stations.len() {
            if self.is_master_station(sid) {
                continue;
            }
            let Some(&e) = self.queue.entry_for(sid) else {
                continue;
            };
            if !self.is_running(sid) && e.st <= now && now < e.end() {
                self.turn_on_station(sid, e.end() - now);
            }
            if e.st > 0 && now >= e.end() {
                self.turn_off_station(sid, now, true);
            }
        }

        // Collect tombstones and entries past their dequeue time.
        let mut qid = self.queue.len();
        while qid > 0 {
            qid -= 1;
            let e = self.queue.entries()[qid];
            if e.dur == 0 || now >= e.deque_time {
                self.queue.dequeue(qid);
            }
        }

        self.process_dynamic_events(now);
        self.apply_all_station_bits(gpio);

        // Recompute the per-group stop anchors from what is still queued.
        let delay = i64::from(self.opts.station_delay);
        let mut anchors = [0i64; NUM_SEQ_GROUPS];
        if !self.opts.remote_extension {
            for e in self.queue.entries() {
                if e.end() <= now {
                    continue;
                }
                if let Some(g) = self.stations[e.sid].group {
                    let slot = &mut anchors[g as usize];
                    *slot = (*slot).max(e.end() + delay);
                }
            }
        }
        self.queue.last_seq_stop_times = anchors;

        if self.queue.is_empty() {
            self.clear_all_station_bits();
            self.apply_all_station_bits(gpio);
            self.queue.reset_runtime();
            self.status.program_busy = false;
            self.queue.clear_pause();

            if self.opts.sensor1.kind == crate::config::SensorType::Flow {
                let pulses = self.flow.count.saturating_sub(self.flowcount_log_start);
                self.log.write_event(
                    LogEvent::FlowSession {
                        pulses,
                        active_secs: (now - self.flow_session_start).max(0),
                    },
                    now,
                );
                self.notif.add(Notification::FlowSensor { pulses });
            }

            // Options may have been edited while the program ran.
            self.masters = self.opts.masters;
        }
    }

    // -----------------------------------------------------------------
    // Valve transitions
    // -----------------------------------------------------------------

    pub(crate) fn turn_on_station(&mut self, sid: usize, duration: i64) {
        self.flow.begin_run();
        if self.set_station_bit(sid, true) {
            info!(sid, duration, "station on");
            self.notif.add(Notification::StationOn { sid, duration });
        }
    }

    /// Close a station's valve and settle its queue entry. With `shift`,
    /// sequential followers in the group move up by the cancelled
    /// remainder. No-op when the station has no queue entry.
    pub(crate) fn turn_off_station(&mut self, sid: usize, now: i64, shift: bool) {
        let Some(qid) = self.qid_for(sid) else {
            return;
        };
        let Some(&e) = self.queue.get(qid) else {
            return;
        };
        let was_running = self.is_running(sid);

        if shift && self.stations[sid].is_sequential() && !self.opts.remote_extension {
            self.shift_remaining_stations(qid, now);
        }

        let mut force_dequeue = false;
        if now >= e.deque_time {
            if was_running {
                force_dequeue = true;
            } else {
                // Already off; just drop the entry.
                self.queue.dequeue(qid);
                return;
            }
        } else if now >= e.end() && !was_running {
            return;
        }

        self.set_station_bit(sid, false);
        let gpm = self.flow.end_run();

        // A station cancelled before its window opened has nothing to log.
        if now >= e.st && !self.is_master_station(sid) {
            let run = LastRun {
                sid,
                pid: e.pid,
                duration: now - e.st,
                end_time: now,
            };
            self.queue.lastrun = Some(run);
            info!(sid, duration = run.duration, "station off");

            let flow_fitted = self.opts.sensor1.kind == crate::config::SensorType::Flow;
            self.log.write_station_run(&run, flow_fitted.then_some(gpm));
            self.notif.add(Notification::StationOff {
                sid,
                duration: run.duration,
            });
            if flow_fitted {
                self.notif.add(Notification::FlowAlert { sid, gpm });
            }
        }

        // Closing the last station of a group idles its anchor.
        if let Some(g) = self.stations[sid].group {
            let delay = i64::from(self.opts.station_delay);
            if e.end() + delay == self.queue.last_seq_stop_times[g as usize] {
                self.queue.last_seq_stop_times[g as usize] = 0;
            }
        }

        if force_dequeue {
            self.queue.dequeue(qid);
        }
    }

    /// Pull every later sequential run in the cancelled entry's group
    /// forward by the unused remainder of its window.
    fn shift_remaining_stations(&mut self, qid: usize, now: i64) {
        let e = self.queue.entries()[qid];
        let Some(gid) = self.stations[e.sid].group else {
            return;
        };
        let end = e.end();
        let mut remainder = 0;

        if end > now {
            remainder = if e.st < now { end - now } else { e.dur };
            for i in 0..self.queue.len() {
                if i == qid {
                    continue;
                }
                let s = self.queue.entries()[i];
                if self.stations[s.sid].group != Some(gid) {
                    continue;
                }
                if s.st >= end {
                    let follower = self.queue.get_mut(i).expect("index within bounds");
                    follower.st -= remainder;
                    follower.deque_time -= remainder;
                }
            }
        }
        let anchor = &mut self.queue.last_seq_stop_times[gid as usize];
        *anchor -= remainder;
        // Nudge the anchor off the closing entry's own stop time so the
        // group-idle reset in turn_off only fires for the true last run.
        *anchor += 1;
    }

    // -----------------------------------------------------------------
    // Dynamic events
    // -----------------------------------------------------------------

    /// Cancel queued runs hit by a runtime override: controller disable,
    /// rain delay, or an active rain/soil sensor. Manual runs are exempt;
    /// per-station ignore flags are honoured.
    pub(crate) fn process_dynamic_events(&mut self, now: i64) {
        let sensor1 = self.sensor_active(0);
        let sensor2 = self.sensor_active(1);
        let rain = self.status.rain_delayed;
        let enabled = self.opts.enabled;

        for sid in 0..self.stations.len() {
            if self.is_master_station(sid) {
                continue;
            }
            let Some(&e) = self.queue.entry_for(sid) else {
                continue;
            };
            if e.pid >= PID_MANUAL_FLOOR {
                continue;
            }
            let station = &self.stations[sid];
            let cancel = !enabled
                || (rain && !station.ignore_rain_delay)
                || (sensor1 && !station.ignore_sensor1)
                || (sensor2 && !station.ignore_sensor2);
            if cancel {
                if let Some(qid) = self.qid_for(sid) {
                    if let Some(entry) = self.queue.get_mut(qid) {
                        entry.deque_time = now;
                    }
                }
                self.turn_off_station(sid, now, false);
            }
        }
    }

    // -----------------------------------------------------------------
    // Master zones
    // -----------------------------------------------------------------

    /// A master is energised while any bound station is inside its
    /// adjusted window.
    pub(crate) fn update_master_bits(&mut self, now: i64) {
        for mi in 0..NUM_MASTER_ZONES {
            let Some(m) = self.masters[mi] else { continue };
            let on_adj = i64::from(m.on_adjust_secs);
            let off_adj = i64::from(m.off_adjust_secs);

            let mut energise = false;
            for sid in 0..self.stations.len() {
                if sid == m.sid {
                    continue;
                }
                let Some(&e) = self.queue.entry_for(sid) else {
                    continue;
                };
                if !self.stations[e.sid].use_master[mi] {
                    continue;
                }
                if now >= e.st + on_adj && now <= e.end() + off_adj {
                    energise = true;
                    break;
                }
            }
            self.set_station_bit(m.sid, energise);
        }
    }

    /// Edge-triggered on/off notifications for master zones, which never
    /// pass through `turn_on_station`/`turn_off_station`.
    pub(crate) fn notify_master_edges(&mut self, now: i64) {
        for mi in 0..NUM_MASTER_ZONES {
            let Some(m) = self.masters[mi] else { continue };
            let last_on = self.masters_last_on[mi];
            let bit = self.is_running(m.sid);
            if last_on == 0 && bit {
                self.notif.add(Notification::StationOn {
                    sid: m.sid,
                    duration: 0,
                });
                self.masters_last_on[mi] = now;
            }
            if last_on > 0 && !bit {
                self.notif.add(Notification::StationOff {
                    sid: m.sid,
                    duration: (now - last_on).max(0),
                });
                self.masters_last_on[mi] = 0;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
