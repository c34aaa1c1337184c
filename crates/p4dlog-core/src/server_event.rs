//! Server-event tracker (§4.7): active/paused-thread counts and
//! resource-pressure state, with a running high-water mark that resets
//! after a quiet window.

use chrono::{NaiveDateTime, TimeDelta};

use crate::extract::ServerEventFields;
use crate::model::{LogTime, ServerEvent};

pub struct ServerEventTracker {
    running_threads: u64,
    running_threads_max: u64,
    paused_threads: u64,
    paused_threads_max: u64,
    paused_error_count: u64,
    pause_rate_cpu: u64,
    pause_rate_mem: u64,
    cpu_pressure_state: u8,
    mem_pressure_state: u8,
    last_reset: Option<NaiveDateTime>,
    reset_window: TimeDelta,
}

impl Default for ServerEventTracker {
    fn default() -> Self {
        ServerEventTracker::new(crate::config::Config::new().cmds_max_reset_duration())
    }
}

impl ServerEventTracker {
    /// `reset_window` is `Config::cmds_max_reset_duration()` (§6): how
    /// long the running/paused-thread maxima hold before resetting to
    /// the current instantaneous value.
    pub fn new(reset_window: std::time::Duration) -> Self {
        ServerEventTracker {
            running_threads: 0,
            running_threads_max: 0,
            paused_threads: 0,
            paused_threads_max: 0,
            paused_error_count: 0,
            pause_rate_cpu: 0,
            pause_rate_mem: 0,
            cpu_pressure_state: 0,
            mem_pressure_state: 0,
            last_reset: None,
            reset_window: TimeDelta::from_std(reset_window).unwrap_or(TimeDelta::seconds(10)),
        }
    }

    pub fn running_threads(&self) -> u64 {
        self.running_threads
    }

    /// Bumps the cumulative paused-error count on `--- exited on fatal
    /// server error` (§4.3, §4.7).
    pub fn note_paused_error(&mut self) {
        self.paused_error_count += 1;
    }

    fn maybe_reset_maxima(&mut self, event_time: Option<NaiveDateTime>) {
        let Some(now) = event_time else { return };
        let stale = match self.last_reset {
            Some(last) => now - last > self.reset_window,
            None => true,
        };
        if stale {
            self.running_threads_max = self.running_threads;
            self.paused_threads_max = self.paused_threads;
            self.last_reset = Some(now);
        }
    }

    fn snapshot(&self, line_no: u64, event_time: LogTime) -> ServerEvent {
        ServerEvent {
            event_time,
            line_no,
            running_threads: self.running_threads,
            running_threads_max: self.running_threads_max,
            paused_threads: self.paused_threads,
            paused_threads_max: self.paused_threads_max,
            paused_error_count: self.paused_error_count,
            pause_rate_cpu: self.pause_rate_cpu,
            pause_rate_mem: self.pause_rate_mem,
            cpu_pressure_state: self.cpu_pressure_state,
            mem_pressure_state: self.mem_pressure_state,
        }
    }

    /// Applies one parsed server-event block and returns the
    /// `ServerEvent` to emit for it.
    pub fn apply(&mut self, line_no: u64, event_time: LogTime, fields: ServerEventFields) -> ServerEvent {
        self.maybe_reset_maxima(event_time.get());
        match fields {
            ServerEventFields::ActiveThreads(n) => {
                self.running_threads = n;
                self.running_threads_max = self.running_threads_max.max(n);
            }
            ServerEventFields::PausedThreads(n) => {
                self.paused_threads = n;
                self.paused_threads_max = self.paused_threads_max.max(n);
            }
            ServerEventFields::ResourcePressure {
                pause_rate_cpu,
                pause_rate_mem,
                cpu_pressure_state,
                mem_pressure_state,
            } => {
                self.pause_rate_cpu = pause_rate_cpu;
                self.pause_rate_mem = pause_rate_mem;
                self.cpu_pressure_state = cpu_pressure_state;
                self.mem_pressure_state = mem_pressure_state;
            }
        }
        self.snapshot(line_no, event_time)
    }
}
