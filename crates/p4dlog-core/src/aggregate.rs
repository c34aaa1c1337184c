//! In-flight command aggregator (§4.4): the pid-keyed map and the
//! addition algorithm that merges request/completion/track data into a
//! single emitted record per command occurrence.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use tracing::{trace, warn};

use crate::config::{Config, MAX_RUNNING_THREADS};
use crate::error::ParseError;
use crate::extract::NetworkEstimate;
use crate::model::Command;

const NO_COMPLETION_FAMILY: &[&str] = &[
    "rmt-FileFetch",
    "rmt-FileFetchMulti",
    "rmt-JournalPos",
    "client-Stats",
];

/// `pull` with `-i` and no leading `-I` is the automatic background
/// pull, which never gets a completion line. `rmt-Journal` is
/// deliberately excluded from the family — the newer-revision behavior
/// (§9 design notes).
fn is_automatic_pull_args(args: &str) -> bool {
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let has_lower_i = tokens.iter().any(|t| *t == "-i");
    let has_upper_i = tokens.iter().any(|t| t.starts_with("-I"));
    has_lower_i && !has_upper_i
}

fn is_no_completion_family(cmd: &str, args: &str, forced: bool) -> bool {
    if forced {
        return true;
    }
    if NO_COMPLETION_FAMILY.contains(&cmd) {
        return true;
    }
    cmd == "pull" && is_automatic_pull_args(args)
}

/// The pid-keyed in-flight state plus the handful of cross-block facts
/// (current second, last sync pid, running count) the addition
/// algorithm and the network-estimates special case both need.
pub struct Aggregator {
    in_flight: HashMap<u64, Command>,
    seen_this_second: HashSet<u64>,
    current_second: Option<NaiveDateTime>,
    running_threads: u64,
    last_sync_pid: Option<u64>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Aggregator {
            in_flight: HashMap::new(),
            seen_this_second: HashSet::new(),
            current_second: None,
            running_threads: 0,
            last_sync_pid: None,
        }
    }

    pub fn running_threads(&self) -> u64 {
        self.running_threads
    }

    pub fn in_flight(&self) -> &HashMap<u64, Command> {
        &self.in_flight
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Overwrites the internal running-thread estimate with the
    /// authoritative count from a server-event line (§4.4 last
    /// paragraph).
    pub fn set_authoritative_running_threads(&mut self, n: u64) {
        self.running_threads = n;
    }

    fn note_second(&mut self, t: Option<NaiveDateTime>) {
        if let Some(t) = t {
            if self.current_second != Some(t) {
                self.seen_this_second.clear();
            }
            self.current_second = Some(t);
        }
    }

    fn emit_one(&mut self, mut cmd: Command, emitted: &mut Vec<Command>) {
        if cmd.counted_in_running {
            self.running_threads = self.running_threads.saturating_sub(1);
            cmd.counted_in_running = false;
        }
        emitted.push(cmd);
    }

    /// Applies the addition algorithm for a freshly-parsed `Command`
    /// (§4.4). Returns commands forced out immediately by a replace —
    /// usually zero or one. Errors only on the running-count safety
    /// ceiling.
    pub fn add(&mut self, mut new_cmd: Command, config: &Config) -> Result<Vec<Command>, ParseError> {
        let mut emitted = Vec::new();
        let pid = new_cmd.pid;
        self.note_second(new_cmd.start_time.get().or_else(|| new_cmd.end_time.get()));

        if config.matches_debug_filter(pid, &new_cmd.cmd) {
            trace!(pid, cmd = %new_cmd.cmd, line_no = new_cmd.line_no, "debug filter: observed line for command");
        }

        let seen_before = self.seen_this_second.contains(&pid);
        self.seen_this_second.insert(pid);

        let no_completion =
            is_no_completion_family(&new_cmd.cmd, &new_cmd.args, config.no_completion_records());

        match self.in_flight.remove(&pid) {
            None => {
                if seen_before && new_cmd.has_track_info && new_cmd.has_nontrivial_table() {
                    new_cmd.duplicate_key = true;
                    trace!(pid, line_no = new_cmd.line_no, "duplicate key: reoccurring pid within the same second");
                }
                if !no_completion {
                    self.running_threads += 1;
                    new_cmd.counted_in_running = true;
                }
                self.track_sync_pid(&new_cmd);
                self.in_flight.insert(pid, new_cmd);
            }
            Some(existing) if existing.completed && new_cmd.is_fresh_request => {
                // A fresh request line for a pid whose previous occurrence
                // already completed is a new command, not a continuation —
                // even when it hashes to the same process_key (identical
                // request text recurring within the same second, §8
                // scenario 2). Emit the old one and start the new.
                if !existing.process_key.is_empty() && existing.process_key == new_cmd.process_key {
                    new_cmd.duplicate_key = true;
                    trace!(pid, line_no = new_cmd.line_no, "duplicate key: identical request text recurring after completion");
                }
                self.emit_one(existing, &mut emitted);
                if !no_completion {
                    self.running_threads += 1;
                    new_cmd.counted_in_running = true;
                }
                self.track_sync_pid(&new_cmd);
                self.in_flight.insert(pid, new_cmd);
            }
            Some(existing) => {
                let differs_by_key = !existing.process_key.is_empty()
                    && !new_cmd.process_key.is_empty()
                    && existing.process_key != new_cmd.process_key;

                if differs_by_key {
                    if new_cmd.has_track_info && !new_cmd.has_nontrivial_table() {
                        // Stray track info addressed to a now-different
                        // key: discard the inbound line, keep `existing`.
                        warn!(pid, line_no = new_cmd.line_no, "stray track block for a pid that already moved to a different process key");
                        self.in_flight.insert(pid, existing);
                    } else {
                        self.emit_one(existing, &mut emitted);
                        if !no_completion {
                            self.running_threads += 1;
                            new_cmd.counted_in_running = true;
                        }
                        self.track_sync_pid(&new_cmd);
                        self.in_flight.insert(pid, new_cmd);
                    }
                } else if no_completion {
                    // Successive pull/rmt-FileFetch bursts: each one
                    // closes the last out immediately.
                    self.emit_one(existing, &mut emitted);
                    new_cmd.duplicate_key = true;
                    trace!(pid, line_no = new_cmd.line_no, "duplicate key: no-completion-family burst closes the prior occurrence");
                    self.track_sync_pid(&new_cmd);
                    self.in_flight.insert(pid, new_cmd);
                } else if existing.has_track_info && new_cmd.has_track_info {
                    if existing.line_no == new_cmd.line_no
                        || (existing.cmd == "user-pull" && !is_automatic_pull_args(&existing.args))
                    {
                        let mut merged = existing;
                        merged.update_from(&new_cmd);
                        merged.has_track_info = true;
                        self.in_flight.insert(pid, merged);
                    } else {
                        self.emit_one(existing, &mut emitted);
                        new_cmd.duplicate_key = true;
                        trace!(pid, line_no = new_cmd.line_no, "duplicate key: mismatched track info forces the prior occurrence out");
                        self.track_sync_pid(&new_cmd);
                        self.in_flight.insert(pid, new_cmd);
                    }
                } else {
                    let carried_track = existing.has_track_info || new_cmd.has_track_info;
                    let mut merged = existing;
                    merged.update_from(&new_cmd);
                    merged.has_track_info = carried_track;
                    self.in_flight.insert(pid, merged);
                }
            }
        }

        if self.running_threads > MAX_RUNNING_THREADS {
            return Err(ParseError::RunningCountExceeded(self.running_threads));
        }

        Ok(emitted)
    }

    fn track_sync_pid(&mut self, cmd: &Command) {
        if cmd.cmd == "user-sync" {
            self.last_sync_pid = Some(cmd.pid);
        }
    }

    /// Applies a network-estimates addendum to the most recently seen
    /// `user-sync` command, per the special case in §4.3.
    pub fn apply_network_estimate(&mut self, est: NetworkEstimate) {
        let Some(pid) = self.last_sync_pid else {
            return;
        };
        if let Some(cmd) = self.in_flight.get_mut(&pid) {
            cmd.net_files_added = est.files_added;
            cmd.net_files_updated = est.files_updated;
            cmd.net_files_deleted = est.files_deleted;
            cmd.net_bytes_added = est.bytes_added;
            cmd.net_bytes_updated = est.bytes_updated;
        }
    }

    /// Removes and returns the in-flight command for `pid`, if any, for
    /// the emission controller's eligibility sweep.
    pub fn take(&mut self, pid: u64) -> Option<Command> {
        self.in_flight.remove(&pid)
    }

    /// Forces the in-flight command for `pid` to completion after the
    /// server reports it removed from the monitor table (§7): marks it
    /// errored and completed, defaulting `end_time` to `start_time` if
    /// unset, and returns it for immediate emission. `None` if `pid`
    /// isn't in flight.
    pub fn force_complete_on_monitor_removal(&mut self, pid: u64) -> Option<Command> {
        let mut cmd = self.in_flight.remove(&pid)?;
        cmd.cmd_error = true;
        cmd.completed = true;
        if cmd.end_time.is_zero() {
            cmd.end_time = cmd.start_time;
        }
        if cmd.counted_in_running {
            self.running_threads = self.running_threads.saturating_sub(1);
            cmd.counted_in_running = false;
        }
        Some(cmd)
    }

    pub fn is_no_completion_family(&self, cmd: &Command, config: &Config) -> bool {
        is_no_completion_family(&cmd.cmd, &cmd.args, config.no_completion_records())
    }

    /// Empties the in-flight map unconditionally (shutdown flush, §4.5).
    pub fn drain_all(&mut self) -> Vec<Command> {
        let mut emitted: Vec<Command> = self.in_flight.drain().map(|(_, c)| c).collect();
        for cmd in &emitted {
            if cmd.counted_in_running {
                self.running_threads = self.running_threads.saturating_sub(1);
            }
        }
        for cmd in &mut emitted {
            cmd.counted_in_running = false;
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogTime;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 9, 2).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn sync_cmd(pid: u64, line_no: u64, key: &str) -> Command {
        let mut c = Command::new(pid, line_no);
        c.cmd = "user-sync".to_string();
        c.process_key = key.to_string();
        c.start_time = LogTime::from_naive(dt(15, 23, 9));
        c.is_fresh_request = true;
        c
    }

    #[test]
    fn insert_new_command_increments_running() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        let cmd = sync_cmd(1616, 1, "abc");
        let emitted = agg.add(cmd, &cfg).unwrap();
        assert!(emitted.is_empty());
        assert_eq!(agg.running_threads(), 1);
        assert!(agg.in_flight().contains_key(&1616));
    }

    #[test]
    fn no_completion_family_does_not_increment_running() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        let mut cmd = Command::new(113249, 1);
        cmd.cmd = "rmt-FileFetch".to_string();
        cmd.process_key = "k1".to_string();
        cmd.start_time = LogTime::from_naive(dt(10, 0, 0));
        agg.add(cmd, &cfg).unwrap();
        assert_eq!(agg.running_threads(), 0);
    }

    #[test]
    fn duplicate_pid_same_second_gets_disambiguated_on_second_cycle() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();

        let mut first = sync_cmd(4496, 10, "key1");
        first.cmd = "edit".to_string();
        first.completed = true;
        let emitted1 = agg.add(first, &cfg).unwrap();
        assert!(emitted1.is_empty());

        // A second, identical request line for the same pid in the same
        // second hashes to the same process_key but is a new occurrence
        // (the prior one already completed) — it must force the first
        // out, disambiguated by line number.
        let mut second = sync_cmd(4496, 20, "key1");
        second.cmd = "edit".to_string();
        let emitted2 = agg.add(second, &cfg).unwrap();
        assert_eq!(emitted2.len(), 1);
        assert!(emitted2[0].duplicate_key);
        assert_eq!(emitted2[0].exported_process_key(), "key1.10");
    }

    #[test]
    fn network_estimate_applies_to_last_sync_pid() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        agg.add(sync_cmd(1616, 1, "k"), &cfg).unwrap();
        agg.apply_network_estimate(NetworkEstimate {
            files_added: 1,
            files_updated: 3,
            files_deleted: 0,
            bytes_added: 111325,
            bytes_updated: 813906,
        });
        let cmd = agg.in_flight().get(&1616).unwrap();
        assert_eq!(cmd.net_files_updated, 3);
        assert_eq!(cmd.net_bytes_added, 111325);
    }

    #[test]
    fn running_count_ceiling_is_fatal() {
        let mut agg = Aggregator::new();
        agg.running_threads = MAX_RUNNING_THREADS;
        let cfg = Config::new();
        let mut cmd = Command::new(999999, 1);
        cmd.cmd = "edit".to_string();
        cmd.process_key = "x".to_string();
        let err = agg.add(cmd, &cfg).unwrap_err();
        assert!(matches!(err, ParseError::RunningCountExceeded(_)));
    }

    #[test]
    fn monitor_table_removal_force_completes_in_flight_command() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        agg.add(sync_cmd(1616, 1, "k"), &cfg).unwrap();

        let forced = agg.force_complete_on_monitor_removal(1616).unwrap();
        assert!(forced.cmd_error);
        assert!(forced.completed);
        assert_eq!(forced.end_time, forced.start_time);
        assert_eq!(agg.in_flight_count(), 0);
        assert_eq!(agg.running_threads(), 0);
    }

    #[test]
    fn monitor_table_removal_is_a_no_op_for_unknown_pid() {
        let mut agg = Aggregator::new();
        assert!(agg.force_complete_on_monitor_removal(999).is_none());
    }

    #[test]
    fn drain_all_empties_in_flight_and_resets_running() {
        let mut agg = Aggregator::new();
        let cfg = Config::new();
        agg.add(sync_cmd(1, 1, "a"), &cfg).unwrap();
        agg.add(sync_cmd(2, 2, "b"), &cfg).unwrap();
        let drained = agg.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(agg.in_flight_count(), 0);
        assert_eq!(agg.running_threads(), 0);
    }
}
