//! p4dlog - p4d server log reconstruction tool.
//!
//! Reads a p4d server log (file or stdin) and writes one JSON record per
//! line to stdout: a reconstructed `Command` for each completed (or
//! shutdown-flushed) request, and a `ServerEvent` for each active/paused
//! thread or resource-pressure line.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use p4dlog_core::{Config, DebugFlags, Engine, EngineStats, Record};

/// p4d server log reconstruction tool.
#[derive(Parser)]
#[command(name = "p4dlog", about = "Reconstructs p4d server log commands and server events", version)]
struct Args {
    /// Log file to read. Omit to read from stdin.
    file: Option<PathBuf>,

    /// Only trace this pid (requires --debug-cmd too).
    #[arg(long, default_value = "")]
    debug_pid: String,

    /// Only trace this command name (requires --debug-pid too).
    #[arg(long, default_value = "")]
    debug_cmd: String,

    /// Debug flags to enable, e.g. "basic,commands,track-running".
    #[arg(long, value_delimiter = ',', value_parser = parse_debug_flag)]
    debug: Vec<DebugFlags>,

    /// How often the emission sweep runs, in seconds.
    #[arg(long, default_value = "1")]
    output_duration: u64,

    /// How often progress is logged at debug level, in seconds.
    #[arg(long, default_value = "30")]
    debug_duration: u64,

    /// Window used to reset running-thread/paused-thread maxima, in seconds.
    #[arg(long, default_value = "10")]
    cmds_max_reset_duration: u64,

    /// Treat commands with no completion record (rmt-FileFetch and
    /// friends) as never holding a running-thread slot.
    #[arg(long)]
    no_completion_records: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses one named debug flag (kebab-case) into its `DebugFlags` bit.
fn parse_debug_flag(s: &str) -> Result<DebugFlags, String> {
    match s.trim() {
        "basic" => Ok(DebugFlags::BASIC),
        "database" => Ok(DebugFlags::DATABASE),
        "json" => Ok(DebugFlags::JSON),
        "commands" => Ok(DebugFlags::COMMANDS),
        "add-commands" => Ok(DebugFlags::ADD_COMMANDS),
        "track-running" => Ok(DebugFlags::TRACK_RUNNING),
        "unrecognised" => Ok(DebugFlags::UNRECOGNISED),
        "pending" => Ok(DebugFlags::PENDING),
        "pending-counts" => Ok(DebugFlags::PENDING_COUNTS),
        "track-paused" => Ok(DebugFlags::TRACK_PAUSED),
        "metric-stats" => Ok(DebugFlags::METRIC_STATS),
        "lines" => Ok(DebugFlags::LINES),
        other => Err(format!("unknown debug flag '{}'", other)),
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -v/-vv for more, -q for errors only.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("p4dlog={}", level).parse().unwrap())
        .add_directive(format!("p4dlog_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Wraps a line iterator so it stops yielding once `shutdown` flips,
/// letting Ctrl-C cut a long-running file/stdin read short without
/// losing the in-flight commands the engine has already aggregated —
/// `Engine::run`'s shutdown flush still sees whatever was read so far.
struct Interruptible<I> {
    inner: I,
    shutdown: Arc<AtomicBool>,
}

impl<I: Iterator<Item = io::Result<String>>> Iterator for Interruptible<I> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        match self.inner.next()? {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("error reading input: {}", e);
                None
            }
        }
    }
}

fn build_config(args: &Args) -> Result<Config, p4dlog_core::ParseError> {
    let mut debug_level = DebugFlags::empty();
    for flag in &args.debug {
        debug_level |= *flag;
    }

    let config = Config::new()
        .with_debug_level(debug_level)
        .with_debug_filter(args.debug_pid.clone(), args.debug_cmd.clone())?
        .with_output_duration(Duration::from_secs(args.output_duration))
        .with_debug_duration(Duration::from_secs(args.debug_duration))
        .with_cmds_max_reset_duration(Duration::from_secs(args.cmds_max_reset_duration))
        .with_no_completion_records(args.no_completion_records);
    Ok(config)
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = match build_config(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    info!("p4dlog {} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        handler_shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {}", e);
    }

    let lines: Box<dyn Iterator<Item = io::Result<String>> + Send> = match &args.file {
        Some(path) => match File::open(path) {
            Ok(f) => Box::new(BufReader::new(f).lines()),
            Err(e) => {
                error!("failed to open {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Box::new(BufReader::new(io::stdin()).lines()),
    };

    let lines = Interruptible { inner: lines, shutdown: shutdown.clone() };

    let stats = Arc::new(EngineStats::new());
    let stdout = io::stdout();
    let engine = Engine::new(config);

    let result = engine.run(
        lines,
        |record| {
            let mut out = stdout.lock();
            match serde_json::to_writer(&mut out, &record) {
                Ok(()) => {
                    use io::Write;
                    let _ = writeln!(out);
                }
                Err(e) => warn!("failed to serialize {:?}: {}", record_kind(&record), e),
            }
        },
        stats.clone(),
    );

    let snap = stats.snapshot();
    info!(
        "done: {} lines read, {} blocks, {} commands emitted, {} server events, {} parse misses",
        snap.lines_read, snap.blocks_segmented, snap.commands_emitted, snap.server_events_emitted, snap.parse_misses
    );

    if let Err(e) = result {
        error!("engine aborted: {}", e);
        std::process::exit(1);
    }
}

fn record_kind(record: &Record) -> &'static str {
    match record {
        Record::Command(_) => "Command",
        Record::ServerEvent(_) => "ServerEvent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_debug_flag_accepts_known_names() {
        assert_eq!(parse_debug_flag("basic").unwrap(), DebugFlags::BASIC);
        assert_eq!(parse_debug_flag("track-running").unwrap(), DebugFlags::TRACK_RUNNING);
        assert!(parse_debug_flag("nonsense").is_err());
    }

    #[test]
    fn build_config_rejects_one_sided_debug_filter() {
        let args = Args {
            file: None,
            debug_pid: "1616".to_string(),
            debug_cmd: String::new(),
            debug: vec![],
            output_duration: 1,
            debug_duration: 30,
            cmds_max_reset_duration: 10,
            no_completion_records: false,
            verbose: 0,
            quiet: false,
        };
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn build_config_combines_debug_flags() {
        let args = Args {
            file: None,
            debug_pid: String::new(),
            debug_cmd: String::new(),
            debug: vec![DebugFlags::BASIC, DebugFlags::COMMANDS],
            output_duration: 2,
            debug_duration: 30,
            cmds_max_reset_duration: 10,
            no_completion_records: true,
            verbose: 0,
            quiet: false,
        };
        let config = build_config(&args).unwrap();
        assert!(config.debug_level().contains(DebugFlags::BASIC));
        assert!(config.debug_level().contains(DebugFlags::COMMANDS));
        assert!(config.no_completion_records());
        assert_eq!(config.output_duration(), Duration::from_secs(2));
    }

    #[test]
    fn interruptible_stops_once_flagged() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let src: Vec<io::Result<String>> =
            vec![Ok("a".to_string()), Ok("b".to_string()), Ok("c".to_string())];
        let mut it = Interruptible { inner: src.into_iter(), shutdown: shutdown.clone() };
        assert_eq!(it.next(), Some("a".to_string()));
        shutdown.store(true, Ordering::SeqCst);
        assert_eq!(it.next(), None);
    }
}
