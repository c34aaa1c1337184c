//! Engine metrics snapshot (SPEC_FULL.md §10.6). Mutex-guarded the same
//! way cross-stage metrics reads are synchronized in §5: the lock is
//! held only for the duration of snapshot construction, never while the
//! pipeline is running.

use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatsSnapshot {
    pub lines_read: u64,
    pub blocks_segmented: u64,
    pub commands_emitted: u64,
    pub server_events_emitted: u64,
    pub parse_misses: u64,
    pub in_flight: u64,
    pub running_threads: u64,
}

#[derive(Default)]
struct Counters {
    lines_read: u64,
    blocks_segmented: u64,
    commands_emitted: u64,
    server_events_emitted: u64,
    parse_misses: u64,
    in_flight: u64,
    running_threads: u64,
}

/// Counters updated by the block-processing stage, read by anything
/// that wants a metrics snapshot (the CLI's periodic log line, a future
/// Prometheus exporter). Never touched by the line-reading stage.
pub struct EngineStats(Mutex<Counters>);

impl Default for EngineStats {
    fn default() -> Self {
        EngineStats::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        EngineStats(Mutex::new(Counters::default()))
    }

    pub fn record_line(&self) {
        self.0.lock().unwrap().lines_read += 1;
    }

    pub fn record_block(&self) {
        self.0.lock().unwrap().blocks_segmented += 1;
    }

    pub fn record_commands_emitted(&self, n: u64) {
        self.0.lock().unwrap().commands_emitted += n;
    }

    pub fn record_server_events_emitted(&self, n: u64) {
        self.0.lock().unwrap().server_events_emitted += n;
    }

    pub fn record_parse_misses(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.0.lock().unwrap().parse_misses += n;
    }

    pub fn set_in_flight(&self, n: usize) {
        self.0.lock().unwrap().in_flight = n as u64;
    }

    pub fn set_running_threads(&self, n: u64) {
        self.0.lock().unwrap().running_threads = n;
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let c = self.0.lock().unwrap();
        EngineStatsSnapshot {
            lines_read: c.lines_read,
            blocks_segmented: c.blocks_segmented,
            commands_emitted: c.commands_emitted,
            server_events_emitted: c.server_events_emitted,
            parse_misses: c.parse_misses,
            in_flight: c.in_flight,
            running_threads: c.running_threads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot_reads_current_values() {
        let stats = EngineStats::new();
        stats.record_line();
        stats.record_line();
        stats.record_block();
        stats.record_commands_emitted(3);
        stats.set_in_flight(7);
        stats.set_running_threads(2);

        let snap = stats.snapshot();
        assert_eq!(snap.lines_read, 2);
        assert_eq!(snap.blocks_segmented, 1);
        assert_eq!(snap.commands_emitted, 3);
        assert_eq!(snap.in_flight, 7);
        assert_eq!(snap.running_threads, 2);
    }

    #[test]
    fn zero_parse_misses_is_a_no_op() {
        let stats = EngineStats::new();
        stats.record_parse_misses(0);
        assert_eq!(stats.snapshot().parse_misses, 0);
    }
}
