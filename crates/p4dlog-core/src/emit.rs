//! Emission controller (§4.5): decides which in-flight commands are
//! eligible for output on each sweep, and orders them for emission.

use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, TimeDelta};

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::model::Command;

/// The fixed 3-second window used throughout §4.4/§4.5 — independent of
/// the configurable output-gating duration.
const ELIGIBILITY_WINDOW: TimeDelta = TimeDelta::seconds(3);

pub struct EmissionController {
    last_emit_log_time: Option<NaiveDateTime>,
    last_sweep_wall_time: Option<Instant>,
}

impl Default for EmissionController {
    fn default() -> Self {
        EmissionController::new()
    }
}

impl EmissionController {
    pub fn new() -> Self {
        EmissionController {
            last_emit_log_time: None,
            last_sweep_wall_time: None,
        }
    }

    fn is_eligible(
        &self,
        cmd: &Command,
        is_no_completion_family: bool,
        current_start_time: NaiveDateTime,
    ) -> bool {
        if cmd.completed && cmd.has_track_info {
            return true;
        }
        if cmd.completed {
            if let Some(end) = cmd.end_time.get() {
                if current_start_time - end >= ELIGIBILITY_WINDOW {
                    return true;
                }
            }
            match self.last_emit_log_time {
                Some(last) if current_start_time - last >= ELIGIBILITY_WINDOW => return true,
                None => return true,
                _ => {}
            }
        }
        if cmd.has_track_info {
            if let Some(start) = cmd.start_time.get() {
                let computed_end =
                    start + TimeDelta::milliseconds((cmd.completed_lapse * 1000.0) as i64);
                if current_start_time - computed_end >= ELIGIBILITY_WINDOW {
                    return true;
                }
            }
        }
        if is_no_completion_family {
            if let Some(start) = cmd.start_time.get() {
                if current_start_time - start >= ELIGIBILITY_WINDOW {
                    return true;
                }
            }
        }
        false
    }

    /// Runs one sweep if the output-gating duration has elapsed since
    /// the last one (wall-clock throttle). Eligible commands are
    /// removed from `agg`, sorted by original line number, and
    /// returned. `now` is supplied by the caller's clock (§4.6).
    pub fn sweep(
        &mut self,
        agg: &mut Aggregator,
        config: &Config,
        current_start_time: NaiveDateTime,
        now: Instant,
    ) -> Vec<Command> {
        if let Some(last) = self.last_sweep_wall_time {
            if now.duration_since(last) < config.output_duration() {
                return Vec::new();
            }
        }
        self.last_sweep_wall_time = Some(now);
        self.run_eligibility_pass(agg, config, current_start_time)
    }

    fn run_eligibility_pass(
        &mut self,
        agg: &mut Aggregator,
        config: &Config,
        current_start_time: NaiveDateTime,
    ) -> Vec<Command> {
        let eligible_pids: Vec<u64> = agg
            .in_flight()
            .iter()
            .filter(|(_, cmd)| {
                let family = agg.is_no_completion_family(cmd, config);
                self.is_eligible(cmd, family, current_start_time)
            })
            .map(|(pid, _)| *pid)
            .collect();

        let mut out: Vec<Command> = eligible_pids
            .into_iter()
            .filter_map(|pid| agg.take(pid))
            .collect();
        out.sort_by_key(|c| c.line_no);

        if let Some(last) = out.last() {
            let stamp = last.end_time.get().or_else(|| last.start_time.get());
            if let Some(stamp) = stamp {
                self.last_emit_log_time = Some(self.last_emit_log_time.map_or(stamp, |l| l.max(stamp)));
            }
        }
        out
    }

    /// Forces an unconditional eligibility pass, ignoring the wall-clock
    /// throttle. The aggregator's own forced-emission paths inside `add`
    /// bypass this controller entirely (they emit directly); this is for
    /// callers that want a sweep without waiting on `output_duration`.
    pub fn sweep_now(
        &mut self,
        agg: &mut Aggregator,
        config: &Config,
        current_start_time: NaiveDateTime,
    ) -> Vec<Command> {
        self.run_eligibility_pass(agg, config, current_start_time)
    }
}

/// Sorts an arbitrary batch of commands by request line number — the
/// order guarantee within a single sweep (§5 Ordering guarantees).
pub fn sort_for_emission(mut commands: Vec<Command>) -> Vec<Command> {
    commands.sort_by_key(|c| c.line_no);
    commands
}

pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogTime;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 9, 2).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn completed_with_track_info_is_always_eligible() {
        let ctrl = EmissionController::new();
        let mut cmd = Command::new(1, 1);
        cmd.completed = true;
        cmd.has_track_info = true;
        assert!(ctrl.is_eligible(&cmd, false, dt(0, 0, 0)));
    }

    #[test]
    fn no_completion_family_waits_three_seconds_from_start() {
        let ctrl = EmissionController::new();
        let mut cmd = Command::new(1, 1);
        cmd.start_time = LogTime::from_naive(dt(10, 0, 0));
        assert!(!ctrl.is_eligible(&cmd, true, dt(10, 0, 2)));
        assert!(ctrl.is_eligible(&cmd, true, dt(10, 0, 3)));
    }

    #[test]
    fn sweep_emits_sorted_by_line_number() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        let mut a = Command::new(1, 50);
        a.cmd = "edit".to_string();
        a.process_key = "a".to_string();
        a.completed = true;
        a.has_track_info = true;
        let mut b = Command::new(2, 10);
        b.cmd = "edit".to_string();
        b.process_key = "b".to_string();
        b.completed = true;
        b.has_track_info = true;
        agg.add(a, &cfg).unwrap();
        agg.add(b, &cfg).unwrap();

        let mut ctrl = EmissionController::new();
        let out = ctrl.sweep_now(&mut agg, &cfg, dt(0, 0, 0));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].line_no, 10);
        assert_eq!(out[1].line_no, 50);
    }

    #[test]
    fn wall_clock_throttle_suppresses_rapid_sweeps() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        let mut ctrl = EmissionController::new();
        let now = Instant::now();
        ctrl.sweep(&mut agg, &cfg, dt(0, 0, 0), now);
        let out = ctrl.sweep(&mut agg, &cfg, dt(0, 0, 0), now);
        assert!(out.is_empty());
    }
}
