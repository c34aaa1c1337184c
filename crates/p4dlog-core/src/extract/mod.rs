//! Field extractors (§4.3): turns one segmented `Block` into whatever it
//! represents — a command's request/completion/track data, a bare
//! network-estimates addendum, or a server event.

pub mod numeric;
pub mod request;
pub mod track;

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use regex::Regex;

use crate::model::{Command, LogTime};
use crate::segment::{Block, BlockTag};
use request::{parse_compute_end, parse_completed, parse_request_line};
use track::TrackState;

pub(crate) fn parse_log_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y/%m/%d %H:%M:%S").ok()
}

/// `\tServer network estimates: files added/updated/deleted=a/b/c, bytes
/// added/updated=d/e`, applied to the most recently seen `user-sync`
/// pid rather than to any pid carried by its own block (§4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkEstimate {
    pub files_added: u64,
    pub files_updated: u64,
    pub files_deleted: u64,
    pub bytes_added: u64,
    pub bytes_updated: u64,
}

fn monitor_table_removal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"pid (?P<pid>\d+).*' exited unexpectedly, removed from monitor table\.").unwrap()
    })
}

fn network_estimate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Server network estimates: files added/updated/deleted=(\d+)/(\d+)/(\d+), bytes added/updated=(\d+)/(\d+)",
        )
        .unwrap()
    })
}

/// What one `Info`/`Error` block contributed.
#[derive(Default)]
pub struct CommandBlockResult {
    pub pid: Option<u64>,
    pub command: Option<Command>,
    pub has_request: bool,
    pub has_completion: bool,
    pub has_track_info: bool,
    pub network_estimate: Option<NetworkEstimate>,
    /// Lines in the block that matched no extractor (§7 parse miss).
    pub parse_misses: u64,
    pub saw_fatal_error: bool,
    /// Set when the block reports a pid removed from the monitor table
    /// before completing normally (§7).
    pub monitor_table_removal: Option<u64>,
}

/// Parses an `Info` or `Error` block. A block may carry a request line,
/// a bare completion, track lines, or — for the network-estimates
/// addendum — none of the above, in which case `pid` is `None` and the
/// caller applies `network_estimate` to its own last-sync-pid state.
pub fn parse_command_block(block: &Block) -> CommandBlockResult {
    let mut result = CommandBlockResult::default();
    let mut track = TrackState::new();
    let mut command: Option<Command> = None;

    for line in &block.lines {
        if let Some(m) = monitor_table_removal_re().captures(line) {
            result.monitor_table_removal = Some(m["pid"].parse().unwrap_or(0));
            continue;
        }

        if let Some(m) = network_estimate_re().captures(line) {
            result.network_estimate = Some(NetworkEstimate {
                files_added: m[1].parse().unwrap_or(0),
                files_updated: m[2].parse().unwrap_or(0),
                files_deleted: m[3].parse().unwrap_or(0),
                bytes_added: m[4].parse().unwrap_or(0),
                bytes_updated: m[5].parse().unwrap_or(0),
            });
            continue;
        }

        if let Some(parsed) = parse_request_line(line, block.first_line_no) {
            result.pid = Some(parsed.command.pid);
            result.has_request = true;
            track.set_pending_trigger(parsed.trigger_name);
            command = Some(parsed.command);
            continue;
        }

        if let Some(ce) = parse_compute_end(line) {
            result.pid.get_or_insert(ce.pid);
            let cmd = command.get_or_insert_with(|| Command::new(ce.pid, block.first_line_no));
            cmd.compute_lapse = ce.seconds;
            continue;
        }

        if let Some(c) = parse_completed(line) {
            result.pid.get_or_insert(c.pid);
            result.has_completion = true;
            let cmd = command.get_or_insert_with(|| Command::new(c.pid, block.first_line_no));
            cmd.completed_lapse = c.seconds;
            cmd.completed = true;
            if let Some(usage) = c.usage {
                cmd.user_cpu_ms = usage.user_cpu_ms;
                cmd.system_cpu_ms = usage.system_cpu_ms;
                cmd.disk_in_pages = usage.disk_in_pages;
                cmd.disk_out_pages = usage.disk_out_pages;
                cmd.ipc_in = usage.ipc_in;
                cmd.ipc_out = usage.ipc_out;
                cmd.max_rss_kb = usage.max_rss_kb;
                cmd.page_faults = usage.page_faults;
            }
            continue;
        }

        let matched = if let Some(cmd) = command.as_mut() {
            track.apply_line(line, cmd)
        } else {
            // Track lines arriving with no request/completion yet still
            // need somewhere to land (e.g. a completion-only block whose
            // request was never seen, §8 boundary behavior).
            let mut cmd = Command::new(0, block.first_line_no);
            let matched = track.apply_line(line, &mut cmd);
            if matched {
                command = Some(cmd);
            }
            matched
        };

        if !matched && !line.is_empty() {
            result.parse_misses += 1;
        }
    }

    if block.tag == BlockTag::Error {
        if let Some(cmd) = command.as_mut() {
            cmd.cmd_error = true;
        } else if let Some(pid) = extract_error_pid(block) {
            let mut cmd = Command::new(pid, block.first_line_no);
            cmd.cmd_error = true;
            result.pid = Some(pid);
            command = Some(cmd);
        }
    }

    result.has_track_info = track.has_track_info;
    result.saw_fatal_error = track.saw_fatal_error;
    if let Some(cmd) = command.as_mut() {
        cmd.has_track_info = track.has_track_info;
    }
    result.command = command;
    result
}

fn error_pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\tPid (\d+)").unwrap())
}

fn extract_error_pid(block: &Block) -> Option<u64> {
    block
        .lines
        .iter()
        .find_map(|l| error_pid_re().captures(l))
        .map(|c| c[1].parse().unwrap_or(0))
}

/// Parses an `ActiveThreads`/`PausedThreads`/`ResourcePressure` block
/// into the fields it sets; the caller (server-event tracker) owns the
/// running maxima and merges them in (§4.7).
pub enum ServerEventFields {
    ActiveThreads(u64),
    PausedThreads(u64),
    ResourcePressure {
        pause_rate_cpu: u64,
        pause_rate_mem: u64,
        cpu_pressure_state: u8,
        mem_pressure_state: u8,
    },
}

fn active_threads_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) active threads\.$").unwrap())
}

fn paused_threads_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+) paused threads\.$").unwrap())
}

fn resource_pressure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Pause rate CPU (\d+)%, mem (\d+)%, CPU pressure (\d+), mem pressure (\d+)",
        )
        .unwrap()
    })
}

fn event_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})").unwrap())
}

pub struct ParsedServerEventBlock {
    pub line_no: u64,
    pub event_time: LogTime,
    pub fields: Option<ServerEventFields>,
}

pub fn parse_server_event_block(block: &Block) -> ParsedServerEventBlock {
    let line = block.lines.first().map(String::as_str).unwrap_or("");
    let event_time = event_time_re()
        .captures(line)
        .and_then(|c| parse_log_datetime(&c[1]))
        .map(LogTime::from_naive)
        .unwrap_or_else(LogTime::zero);

    let fields = match block.tag {
        BlockTag::ActiveThreads => active_threads_re()
            .captures(line)
            .map(|c| ServerEventFields::ActiveThreads(c[1].parse().unwrap_or(0))),
        BlockTag::PausedThreads => paused_threads_re()
            .captures(line)
            .map(|c| ServerEventFields::PausedThreads(c[1].parse().unwrap_or(0))),
        BlockTag::ResourcePressure => {
            resource_pressure_re().captures(line).map(|c| ServerEventFields::ResourcePressure {
                pause_rate_cpu: c[1].parse().unwrap_or(0),
                pause_rate_mem: c[2].parse().unwrap_or(0),
                cpu_pressure_state: c[3].parse().unwrap_or(0),
                mem_pressure_state: c[4].parse().unwrap_or(0),
            })
        }
        _ => None,
    };

    ParsedServerEventBlock {
        line_no: block.first_line_no,
        event_time,
        fields,
    }
}
