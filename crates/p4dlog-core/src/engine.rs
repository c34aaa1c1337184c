//! Wires the three-stage pipeline (§5): a line-reading/segmenting
//! thread, an internal (or external) clock thread, both merged onto one
//! channel read by the block-processing/aggregation/emission stage,
//! which owns all parser state and runs on the caller's thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::{debug, error, trace};

use crate::aggregate::Aggregator;
use crate::clock::{forward_external_clock, spawn_debug_ticker, spawn_wall_clock, EngineEvent};
use crate::config::Config;
use crate::emit::EmissionController;
use crate::error::ParseError;
use crate::extract::{parse_command_block, parse_server_event_block};
use crate::model::Record;
use crate::segment::{BlockTag, Segmenter};
use crate::server_event::ServerEventTracker;
use crate::stats::EngineStats;

pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Engine { config }
    }

    /// Runs the pipeline to completion over `lines`, calling
    /// `on_record` for each emitted `Record` in order. Blocks the
    /// calling thread for the duration of the run; returns once `lines`
    /// is exhausted and all in-flight commands have been flushed.
    ///
    /// Drives its own clock from an internal wall-clock ticker (§4.6,
    /// source (b)). Use [`Engine::run_with_external_clock`] when the
    /// caller has a real timestamp source to drive emission timing
    /// instead.
    ///
    /// Fails only on the running-count safety ceiling (§4.5); when it
    /// does, the in-flight state is abandoned rather than flushed, per
    /// §7's "abort" language.
    pub fn run<I, F>(&self, lines: I, on_record: F, stats: Arc<EngineStats>) -> Result<(), ParseError>
    where
        I: Iterator<Item = String> + Send + 'static,
        F: FnMut(Record),
    {
        self.run_inner(lines, on_record, stats, None)
    }

    /// Like [`Engine::run`], but drives the clock from a caller-supplied
    /// timestamp source instead of the wall clock (§4.6, source (a)).
    /// Each timestamp received on `external` advances the controller's
    /// notion of current time; a separate debug ticker still fires on
    /// its own wall-clock cadence since `external` carries no
    /// periodic heartbeat of its own.
    pub fn run_with_external_clock<I, F>(
        &self,
        lines: I,
        on_record: F,
        stats: Arc<EngineStats>,
        external: mpsc::Receiver<NaiveDateTime>,
    ) -> Result<(), ParseError>
    where
        I: Iterator<Item = String> + Send + 'static,
        F: FnMut(Record),
    {
        self.run_inner(lines, on_record, stats, Some(external))
    }

    fn run_inner<I, F>(
        &self,
        lines: I,
        mut on_record: F,
        stats: Arc<EngineStats>,
        external: Option<mpsc::Receiver<NaiveDateTime>>,
    ) -> Result<(), ParseError>
    where
        I: Iterator<Item = String> + Send + 'static,
        F: FnMut(Record),
    {
        let (tx, rx) = mpsc::channel::<EngineEvent>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let tickers: Vec<std::thread::JoinHandle<()>> = match external {
            None => vec![spawn_wall_clock(
                tx.clone(),
                self.config.output_duration(),
                self.config.debug_duration(),
                shutdown.clone(),
            )],
            Some(external) => vec![
                forward_external_clock(tx.clone(), external),
                spawn_debug_ticker(tx.clone(), self.config.debug_duration(), shutdown.clone()),
            ],
        };

        let reader_tx = tx.clone();
        let reader_stats = stats.clone();
        let reader_shutdown = shutdown.clone();
        let reader = std::thread::spawn(move || {
            let mut segmenter = Segmenter::new();
            for line in lines {
                reader_stats.record_line();
                if let Some(block) = segmenter.feed(&line) {
                    reader_stats.record_block();
                    if reader_tx.send(EngineEvent::Block(block)).is_err() {
                        reader_shutdown.store(true, Ordering::SeqCst);
                        return;
                    }
                }
            }
            if let Some(block) = segmenter.flush() {
                reader_stats.record_block();
                let _ = reader_tx.send(EngineEvent::Block(block));
            }
            // Input is exhausted: tell the ticker to stop so its sender
            // clone drops and the merged channel can close (§5
            // cancellation: closing the line stage propagates to a
            // flush-and-close of the block stage).
            reader_shutdown.store(true, Ordering::SeqCst);
        });
        drop(tx);

        let mut aggregator = Aggregator::new();
        let mut emission = EmissionController::new();
        let mut server_events = ServerEventTracker::new(self.config.cmds_max_reset_duration());
        let mut current_start_time = None;

        let result = self.drive(
            rx,
            &mut aggregator,
            &mut emission,
            &mut server_events,
            &mut current_start_time,
            &mut on_record,
            &stats,
        );

        shutdown.store(true, Ordering::SeqCst);
        let _ = reader.join();
        for ticker in tickers {
            let _ = ticker.join();
        }

        if let Err(ref e) = result {
            error!(error = %e, "engine aborting");
        }
        result?;

        let mut flushed = aggregator.drain_all();
        flushed.sort_by_key(|c| c.line_no);
        stats.record_commands_emitted(flushed.len() as u64);
        for cmd in flushed {
            on_record(Record::Command(cmd));
        }
        stats.set_in_flight(0);
        stats.set_running_threads(aggregator.running_threads());

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn drive(
        &self,
        rx: mpsc::Receiver<EngineEvent>,
        aggregator: &mut Aggregator,
        emission: &mut EmissionController,
        server_events: &mut ServerEventTracker,
        current_start_time: &mut Option<chrono::NaiveDateTime>,
        on_record: &mut impl FnMut(Record),
        stats: &EngineStats,
    ) -> Result<(), ParseError> {
        for event in rx {
            match event {
                EngineEvent::Block(block) => {
                    match block.tag {
                        BlockTag::Info | BlockTag::Error => {
                            let result = parse_command_block(&block);
                            if result.parse_misses > 0 {
                                trace!(misses = result.parse_misses, "unrecognised lines in block");
                            }
                            stats.record_parse_misses(result.parse_misses);
                            if result.saw_fatal_error {
                                server_events.note_paused_error();
                            }
                            if let Some(est) = result.network_estimate {
                                aggregator.apply_network_estimate(est);
                            }
                            if let Some(pid) = result.monitor_table_removal {
                                if let Some(forced) = aggregator.force_complete_on_monitor_removal(pid) {
                                    stats.record_commands_emitted(1);
                                    on_record(Record::Command(forced));
                                }
                            }
                            if let Some(cmd) = result.command {
                                if let Some(t) = cmd.start_time.get().or_else(|| cmd.end_time.get()) {
                                    *current_start_time = Some(t);
                                }
                                let emitted = aggregator.add(cmd, &self.config)?;
                                stats.record_commands_emitted(emitted.len() as u64);
                                for c in emitted {
                                    on_record(Record::Command(c));
                                }
                            }
                        }
                        BlockTag::ActiveThreads | BlockTag::PausedThreads | BlockTag::ResourcePressure => {
                            let parsed = parse_server_event_block(&block);
                            if let Some(t) = parsed.event_time.get() {
                                *current_start_time = Some(t);
                            }
                            if let Some(fields) = parsed.fields {
                                let event = server_events.apply(parsed.line_no, parsed.event_time, fields);
                                aggregator.set_authoritative_running_threads(event.running_threads);
                                stats.record_server_events_emitted(1);
                                on_record(Record::ServerEvent(event));
                            }
                        }
                    }
                    stats.set_in_flight(aggregator.in_flight_count());
                    stats.set_running_threads(aggregator.running_threads());
                }
                EngineEvent::Tick => {
                    if let Some(t) = *current_start_time {
                        let out = emission.sweep(aggregator, &self.config, t, Instant::now());
                        if !out.is_empty() {
                            stats.record_commands_emitted(out.len() as u64);
                            for cmd in out {
                                on_record(Record::Command(cmd));
                            }
                        }
                    }
                    stats.set_in_flight(aggregator.in_flight_count());
                }
                EngineEvent::ExternalTick(t) => {
                    *current_start_time = Some(t);
                    let out = emission.sweep(aggregator, &self.config, t, Instant::now());
                    if !out.is_empty() {
                        stats.record_commands_emitted(out.len() as u64);
                        for cmd in out {
                            on_record(Record::Command(cmd));
                        }
                    }
                    stats.set_in_flight(aggregator.in_flight_count());
                }
                EngineEvent::DebugTick => {
                    debug!(stats = ?stats.snapshot(), "engine progress");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn run_lines(lines: Vec<&str>) -> Vec<Record> {
        let engine = Engine::new(Config::new());
        let stats = Arc::new(EngineStats::new());
        let owned: Vec<String> = lines.into_iter().map(String::from).collect();
        let records = Arc::new(Mutex::new(Vec::new()));
        let records_clone = records.clone();
        engine
            .run(owned.into_iter(), move |r| records_clone.lock().unwrap().push(r), stats)
            .unwrap();
        Arc::try_unwrap(records).unwrap().into_inner().unwrap()
    }

    #[test]
    fn simple_sync_end_to_end_emits_one_command_at_shutdown() {
        let records = run_lines(vec![
            "Perforce server info:",
            "\t2015/09/02 15:23:09 pid 1616 robert@robert-test 127.0.0.1 [App/1] 'user-sync //...'",
            "\t2015/09/02 15:23:09 pid 1616 compute end .031s",
            "\t2015/09/02 15:23:09 pid 1616 completed .031s",
            "",
        ]);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Command(cmd) => {
                assert_eq!(cmd.pid, 1616);
                assert_eq!(cmd.cmd, "user-sync");
                assert_eq!(cmd.compute_lapse, 0.031);
                assert_eq!(cmd.completed_lapse, 0.031);
            }
            _ => panic!("expected a Command record"),
        }
    }

    #[test]
    fn resource_pressure_line_emits_server_event() {
        let records = run_lines(vec![
            "2015/09/02 15:23:09 pid 1056103: Server under resource pressure.  Pause rate CPU 59%, mem 0%, CPU pressure 2, mem pressure 0",
            "",
        ]);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::ServerEvent(ev) => {
                assert_eq!(ev.pause_rate_cpu, 59);
                assert_eq!(ev.cpu_pressure_state, 2);
            }
            _ => panic!("expected a ServerEvent record"),
        }
    }

    #[test]
    fn empty_input_produces_zero_records() {
        let records = run_lines(vec![]);
        assert!(records.is_empty());
    }

    #[test]
    fn external_clock_variant_still_flushes_completed_command() {
        let engine = Engine::new(Config::new());
        let stats = Arc::new(EngineStats::new());
        let lines = vec![
            "Perforce server info:",
            "\t2015/09/02 15:23:09 pid 1616 robert@robert-test 127.0.0.1 [App/1] 'user-sync //...'",
            "\t2015/09/02 15:23:09 pid 1616 compute end .031s",
            "\t2015/09/02 15:23:09 pid 1616 completed .031s",
            "",
        ];
        let owned: Vec<String> = lines.into_iter().map(String::from).collect();
        let records = Arc::new(Mutex::new(Vec::new()));
        let records_clone = records.clone();
        // No timestamps are sent: the sender drops immediately, so the
        // relay thread exits right away and the command is still
        // captured by the end-of-input drain.
        let (_, ext_rx) = mpsc::channel();
        engine
            .run_with_external_clock(owned.into_iter(), move |r| records_clone.lock().unwrap().push(r), stats, ext_rx)
            .unwrap();
        let records = Arc::try_unwrap(records).unwrap().into_inner().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Command(cmd) => assert_eq!(cmd.pid, 1616),
            _ => panic!("expected a Command record"),
        }
    }

    #[test]
    fn monitor_table_removal_force_emits_in_flight_command() {
        let records = run_lines(vec![
            "Perforce server info:",
            "\t2015/09/02 15:23:09 pid 1616 robert@robert-test 127.0.0.1 [App/1] 'user-sync //...'",
            "",
            "Perforce server info:",
            "\t2015/09/02 15:23:10 pid 1616 robert@robert-test 127.0.0.1 [App/1] 'user-sync //...' exited unexpectedly, removed from monitor table.",
            "",
        ]);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Command(cmd) => {
                assert_eq!(cmd.pid, 1616);
                assert!(cmd.cmd_error);
                assert!(cmd.completed);
            }
            _ => panic!("expected a Command record"),
        }
    }
}
