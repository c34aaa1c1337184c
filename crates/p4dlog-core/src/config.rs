//! Engine configuration: debug flags, sweep timing, and safety ceilings.

use std::time::Duration;

use crate::error::ParseError;

/// Hard ceiling on simultaneously-running commands (§4.5 Safety). Crossing
/// this means completion records are not arriving — almost always because
/// `configurable server=3` is unset — and the engine aborts rather than
/// growing the in-flight map without bound.
pub const MAX_RUNNING_THREADS: u64 = 20_000;

bitflags::bitflags! {
    /// `debug_level` as an explicit flag set rather than a magic integer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        const BASIC         = 1 << 0;
        const DATABASE      = 1 << 1;
        const JSON          = 1 << 2;
        const COMMANDS      = 1 << 3;
        const ADD_COMMANDS  = 1 << 4;
        const TRACK_RUNNING = 1 << 5;
        const UNRECOGNISED  = 1 << 6;
        const PENDING       = 1 << 7;
        const PENDING_COUNTS= 1 << 8;
        const TRACK_PAUSED  = 1 << 9;
        const METRIC_STATS  = 1 << 10;
        const LINES         = 1 << 11;
    }
}

/// Engine configuration, built with `Config::new().with_*(...)` the way
/// `Collector` is assembled from its builder methods.
#[derive(Debug, Clone)]
pub struct Config {
    debug_level: DebugFlags,
    debug_pid: String,
    debug_cmd: String,
    output_duration: Duration,
    debug_duration: Duration,
    cmds_max_reset_duration: Duration,
    no_completion_records: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug_level: DebugFlags::empty(),
            debug_pid: String::new(),
            debug_cmd: String::new(),
            output_duration: Duration::from_secs(1),
            debug_duration: Duration::from_secs(30),
            cmds_max_reset_duration: Duration::from_secs(10),
            no_completion_records: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_debug_level(mut self, flags: DebugFlags) -> Self {
        self.debug_level = flags;
        self
    }

    /// Sets the pid/cmd trace filter. Both must be non-empty together, or
    /// both empty; a one-sided filter is rejected.
    pub fn with_debug_filter(
        mut self,
        pid: impl Into<String>,
        cmd: impl Into<String>,
    ) -> Result<Self, ParseError> {
        let pid = pid.into();
        let cmd = cmd.into();
        if pid.is_empty() != cmd.is_empty() {
            return Err(ParseError::InvalidDebugFilter(
                "debug_pid and debug_cmd must be set together".to_string(),
            ));
        }
        self.debug_pid = pid;
        self.debug_cmd = cmd;
        Ok(self)
    }

    pub fn with_output_duration(mut self, d: Duration) -> Self {
        self.output_duration = d;
        self
    }

    pub fn with_debug_duration(mut self, d: Duration) -> Self {
        self.debug_duration = d;
        self
    }

    pub fn with_cmds_max_reset_duration(mut self, d: Duration) -> Self {
        self.cmds_max_reset_duration = d;
        self
    }

    pub fn with_no_completion_records(mut self, enabled: bool) -> Self {
        self.no_completion_records = enabled;
        self
    }

    pub fn debug_level(&self) -> DebugFlags {
        self.debug_level
    }

    pub fn output_duration(&self) -> Duration {
        self.output_duration
    }

    pub fn debug_duration(&self) -> Duration {
        self.debug_duration
    }

    pub fn cmds_max_reset_duration(&self) -> Duration {
        self.cmds_max_reset_duration
    }

    pub fn no_completion_records(&self) -> bool {
        self.no_completion_records
    }

    /// Whether verbose per-command tracing is active for `pid`/`cmd`.
    pub fn matches_debug_filter(&self, pid: u64, cmd: &str) -> bool {
        if self.debug_pid.is_empty() {
            return false;
        }
        self.debug_pid == pid.to_string() && self.debug_cmd == cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = Config::new();
        assert_eq!(cfg.output_duration(), Duration::from_secs(1));
        assert_eq!(cfg.debug_duration(), Duration::from_secs(30));
        assert_eq!(cfg.cmds_max_reset_duration(), Duration::from_secs(10));
        assert!(!cfg.no_completion_records());
        assert!(cfg.debug_level().is_empty());
    }

    #[test]
    fn debug_filter_requires_both_or_neither() {
        let err = Config::new().with_debug_filter("1616", "").unwrap_err();
        assert!(matches!(err, ParseError::InvalidDebugFilter(_)));

        let cfg = Config::new().with_debug_filter("1616", "user-sync").unwrap();
        assert!(cfg.matches_debug_filter(1616, "user-sync"));
        assert!(!cfg.matches_debug_filter(1616, "user-sync2"));
    }

    #[test]
    fn debug_flags_combine() {
        let flags = DebugFlags::BASIC | DebugFlags::TRACK_RUNNING;
        assert!(flags.contains(DebugFlags::BASIC));
        assert!(flags.contains(DebugFlags::TRACK_RUNNING));
        assert!(!flags.contains(DebugFlags::JSON));
    }
}
