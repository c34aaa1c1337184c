//! Extractors for the request line and the two lines that close out a
//! command without ever opening a track block: compute-end and
//! completed (§4.3).

use std::sync::OnceLock;

use regex::Regex;
use xxhash_rust::xxh3::xxh3_128;

use crate::extract::numeric::{parse_lapse, parse_u64};
use crate::model::{Command, LogTime};

fn request_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\t(?P<date>\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}) pid (?P<pid>\d+) (?P<user>[^@\s]+)@(?P<ws>\S+) (?P<ip>\S+) \[(?P<app>[^\]]*)\] '(?P<cmdargs>.*)'$",
        )
        .unwrap()
    })
}

fn compute_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pid (?P<pid>\d+) compute end (?P<secs>\d*\.\d+)s").unwrap())
}

fn completed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"pid (?P<pid>\d+) completed (?P<secs>\d*\.\d+)s(?: (?P<usage>\d+\+\d+us \d+\+\d+io \d+\+\d+net \S+k \d+pf))?",
        )
        .unwrap()
    })
}

fn trigger_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"trigger (?P<name>\S+)'$").unwrap())
}

/// The 8 captures of a recognized request line plus the synthetic
/// trigger name, if the command text invoked one.
pub struct ParsedRequest {
    pub command: Command,
    pub trigger_name: Option<String>,
}

/// Derives the stable `process_key`: a hex xxh3_128 hash (16 bytes, 32
/// hex digits, per the GLOSSARY) of the raw request line.
pub fn process_key_for(raw_line: &str) -> String {
    format!("{:032x}", xxh3_128(raw_line.as_bytes()))
}

/// Matches a tab-prefixed request line and builds the `Command` it
/// opens. Returns `None` if the line isn't a request line at all.
pub fn parse_request_line(line: &str, line_no: u64) -> Option<ParsedRequest> {
    let caps = request_re().captures(line)?;
    let pid = parse_u64(&caps["pid"]);
    let cmdargs = &caps["cmdargs"];
    let (cmd, args) = match cmdargs.split_once(' ') {
        Some((cmd, args)) => (cmd.to_string(), args.to_string()),
        None => (cmdargs.to_string(), String::new()),
    };

    let mut command = Command::new(pid, line_no);
    command.is_fresh_request = true;
    command.process_key = process_key_for(line);
    command.user = caps["user"].to_string();
    command.workspace = caps["ws"].to_string();
    command.ip = caps["ip"].to_string();
    command.app = caps["app"].to_string();
    command.cmd = cmd;
    command.args = args;
    if let Some(dt) = crate::extract::parse_log_datetime(&caps["date"]) {
        command.start_time = LogTime::from_naive(dt);
    }

    let trigger_name = trigger_re()
        .captures(cmdargs)
        .map(|c| c["name"].to_string());

    Some(ParsedRequest {
        command,
        trigger_name,
    })
}

pub struct ComputeEnd {
    pub pid: u64,
    pub seconds: f64,
}

pub fn parse_compute_end(line: &str) -> Option<ComputeEnd> {
    let caps = compute_end_re().captures(line)?;
    Some(ComputeEnd {
        pid: parse_u64(&caps["pid"]),
        seconds: parse_lapse(&caps["secs"]),
    })
}

pub struct UsageFields {
    pub user_cpu_ms: u64,
    pub system_cpu_ms: u64,
    pub disk_in_pages: u64,
    pub disk_out_pages: u64,
    pub ipc_in: u64,
    pub ipc_out: u64,
    pub max_rss_kb: u64,
    pub page_faults: u64,
}

pub struct Completed {
    pub pid: u64,
    pub seconds: f64,
    pub usage: Option<UsageFields>,
}

pub fn parse_completed(line: &str) -> Option<Completed> {
    let caps = completed_re().captures(line)?;
    let usage = caps.name("usage").and_then(|m| parse_usage_fields(m.as_str()));
    Some(Completed {
        pid: parse_u64(&caps["pid"]),
        seconds: parse_lapse(&caps["secs"]),
        usage,
    })
}

/// Parses the `U+Sus D+Dio I+Ionet Rk Ppf` usage suffix shared by the
/// completed line and the standalone `--- usage` track line.
pub fn parse_usage_fields(s: &str) -> Option<UsageFields> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?P<ucpu>\d+)\+(?P<scpu>\d+)us (?P<din>\d+)\+(?P<dout>\d+)io (?P<iin>\d+)\+(?P<iout>\d+)net (?P<rss>\S+)k (?P<pf>\d+)pf",
        )
        .unwrap()
    });
    let caps = re.captures(s)?;
    Some(UsageFields {
        user_cpu_ms: parse_u64(&caps["ucpu"]),
        system_cpu_ms: parse_u64(&caps["scpu"]),
        disk_in_pages: parse_u64(&caps["din"]),
        disk_out_pages: parse_u64(&caps["dout"]),
        ipc_in: parse_u64(&caps["iin"]),
        ipc_out: parse_u64(&caps["iout"]),
        max_rss_kb: crate::extract::numeric::parse_byte_size(&caps["rss"]),
        page_faults: parse_u64(&caps["pf"]),
    })
}
