//! Program matching and start-time assignment.
//!
//! Once per minute the matcher asks every program whether it fires, expands
//! matches into runtime-queue entries (weather-scaled), and hands the queue
//! to the scheduler. The scheduler assigns absolute start and dequeue times:
//! sequential stations chain within their group separated by the station
//! delay, everything else starts concurrently with a one-second stagger,
//! and master lead/lag adjustments widen the dequeue window.

use tracing::{debug, info};

use crate::config::NUM_MASTER_ZONES;
use crate::controller::{Controller, RebootCause, REBOOT_DELAY_SECS};
use crate::notifier::Notification;
use crate::program::{special_command, water_time_resolve, SpecialCommand};
use crate::queue::{QueueEntry, NUM_SEQ_GROUPS};

impl Controller {
    // -----------------------------------------------------------------
    // Per-minute program matcher
    // -----------------------------------------------------------------

    pub(crate) fn match_programs(&mut self, now: i64) {
        let mut any_scheduled = false;
        let mut finished_run_once: Vec<usize> = Vec::new();

        for pid in 0..self.programs.len() {
            let Some(m) = self.programs[pid].check_match(now) else {
                continue;
            };

            if self.programs[pid].name.starts_with(':') {
                let name = self.programs[pid].name.clone();
                if let Some(cmd) = special_command(&name) {
                    self.run_special_command(cmd, now);
                } else {
                    debug!(program = %name, "unknown special command skipped");
                }
                continue;
            }

            let order = self.programs[pid].gen_station_runorder(m.runcount, self.stations.len());

            let mut scheduled = false;
            for sid in order {
                if self.is_master_station(sid) || self.stations[sid].disabled {
                    continue;
                }
                let raw = self.programs[pid].duration_for(sid);
                if raw == 0 {
                    continue;
                }
                let mut dur = water_time_resolve(
                    raw,
                    self.opts.sunrise_minutes,
                    self.opts.sunset_minutes,
                );
                if self.programs[pid].use_weather {
                    let pct = i64::from(self.opts.water_percentage);
                    dur = dur * pct / 100;
                    // Heavily-scaled slivers are not worth opening a valve for.
                    if pct < 20 && dur < 10 {
                        dur = 0;
                    }
                }
                if dur > 0 {
                    let entry = QueueEntry {
                        sid,
                        pid: (pid + 1) as u8,
                        dur,
                        st: 0,
                        deque_time: 0,
                    };
                    if self.queue.enqueue(entry).is_some() {
                        scheduled = true;
                    }
                }
            }

            if scheduled {
                any_scheduled = true;
                let pct = if self.programs[pid].use_weather {
                    self.opts.water_percentage
                } else {
                    100
                };
                self.notif.add(Notification::ProgramSched {
                    pid: pid as u8,
                    pct,
                    manual: false,
                });
            }
            if m.will_delete {
                finished_run_once.push(pid);
            }
        }

        for pid in finished_run_once.into_iter().rev() {
            info!(program = %self.programs[pid].name, "removing finished run-once program");
            self.programs.remove(pid);
        }

        if any_scheduled {
            self.schedule_all_stations(now);
        }
    }

    fn run_special_command(&mut self, cmd: SpecialCommand, now: i64) {
        // The delay pushes the reboot past this minute so the command does
        // not re-fire immediately after restart.
        match cmd {
            SpecialCommand::RebootNow => {
                self.status.safe_reboot = false;
                self.reboot_timer = now + REBOOT_DELAY_SECS;
            }
            SpecialCommand::SafeReboot => {
                self.request_safe_reboot(RebootCause::Program, now + REBOOT_DELAY_SECS);
            }
        }
    }

    // -----------------------------------------------------------------
    // Start-time assignment
    // -----------------------------------------------------------------

    pub(crate) fn schedule_all_stations(&mut self, now: i64) {
        let mut con_start = now + 1;
        if self.queue.pause_state {
            con_start += self.queue.pause_timer;
        }
        let delay = i64::from(self.opts.station_delay);

        // Sequential groups resume at their stop anchor, which already
        // carries the station delay past the last scheduled stop.
        let mut seq_start = [0i64; NUM_SEQ_GROUPS];
        for (g, slot) in seq_start.iter_mut().enumerate() {
            *slot = con_start;
            if self.queue.last_seq_stop_times[g] > now {
                *slot = con_start.max(self.queue.last_seq_stop_times[g]);
            }
        }

        let re = self.opts.remote_extension;
        for qid in 0..self.queue.len() {
            let e = self.queue.entries()[qid];
            if e.st != 0 || e.dur == 0 {
                continue;
            }

            let seq_group = match self.stations[e.sid].group {
                Some(g) if !re => Some(g as usize),
                _ => None,
            };
            let mut st = match seq_group {
                Some(g) => {
                    let s = seq_start[g];
                    seq_start[g] = s + e.dur + delay;
                    s
                }
                None => {
                    let s = con_start;
                    con_start += 1;
                    s
                }
            };

            // Master lead/lag: the widest negative on-adjust of any bound
            // master may need the start pushed back to leave room for the
            // master to energise first; the widest positive off-adjust
            // extends the dequeue window.
            let mut start_adj: i64 = 0;
            let mut dequeue_adj: i64 = 0;
            for mi in 0..NUM_MASTER_ZONES {
                let Some(m) = self.masters[mi] else { continue };
                if m.sid != e.sid && self.stations[e.sid].use_master[mi] {
                    start_adj = start_adj.min(i64::from(m.on_adjust_secs));
                    dequeue_adj = dequeue_adj.max(i64::from(m.off_adjust_secs));
                }
            }
            if st - now < start_adj.abs() {
                st += start_adj.abs();
                if let Some(g) = seq_group {
                    seq_start[g] += start_adj.abs();
                }
            }

            {
                let entry = self.queue.get_mut(qid).expect("qid within bounds");
                entry.st = st;
                entry.deque_time = st + entry.dur + dequeue_adj;
            }

            if !self.status.program_busy {
                self.status.program_busy = true;
                if self.opts.sensor1.kind == crate::config::SensorType::Flow {
                    self.flowcount_log_start = self.flow.count;
                    self.flow_session_start = now;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
