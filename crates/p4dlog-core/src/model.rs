//! Record types emitted by the engine: `Command`, `Table`, `ServerEvent`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
const ZERO_TIME: &str = "0001/01/01 00:00:00";

/// A p4d log timestamp. Wraps `NaiveDateTime` so zero/unset times
/// round-trip through the `0001/01/01 00:00:00` sentinel the source
/// emits rather than through serde's default RFC 3339 rendering.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogTime(Option<NaiveDateTime>);

impl LogTime {
    pub fn zero() -> Self {
        LogTime(None)
    }

    pub fn from_naive(dt: NaiveDateTime) -> Self {
        LogTime(Some(dt))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<NaiveDateTime> {
        self.0
    }

    /// Returns `self` if set, else `other` — the "first wins unless blank"
    /// rule used throughout `updateFrom` merges.
    pub fn or(self, other: LogTime) -> LogTime {
        if self.0.is_some() {
            self
        } else {
            other
        }
    }
}

impl fmt::Debug for LogTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(dt) => write!(f, "{}", dt.format(TIME_FORMAT)),
            None => write!(f, "{}", ZERO_TIME),
        }
    }
}

impl Serialize for LogTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self.0 {
            Some(dt) => serializer.serialize_str(&dt.format(TIME_FORMAT).to_string()),
            None => serializer.serialize_str(ZERO_TIME),
        }
    }
}

impl<'de> Deserialize<'de> for LogTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == ZERO_TIME {
            return Ok(LogTime(None));
        }
        NaiveDateTime::parse_from_str(&s, TIME_FORMAT)
            .map(|dt| LogTime(Some(dt)))
            .map_err(serde::de::Error::custom)
    }
}

/// Per-table per-command aggregate (§3 Table).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Table {
    pub pages_in: u64,
    pub pages_out: u64,
    pub pages_cached: u64,
    pub pages_split_internal: u64,
    pub pages_split_leaf: u64,

    pub read_locks: u64,
    pub write_locks: u64,
    pub get_rows: u64,
    pub pos_rows: u64,
    pub scan_rows: u64,
    pub put_rows: u64,
    pub del_rows: u64,

    pub total_read_wait_ms: u64,
    pub total_read_held_ms: u64,
    pub total_write_wait_ms: u64,
    pub total_write_held_ms: u64,

    pub max_read_wait_ms: u64,
    pub max_read_held_ms: u64,
    pub max_write_wait_ms: u64,
    pub max_write_held_ms: u64,

    pub peek_count: u64,
    pub peek_wait_ms: u64,
    pub peek_held_ms: u64,
    pub max_peek_wait_ms: u64,
    pub max_peek_held_ms: u64,

    /// Set only on synthetic `trigger_NAME` tables (§4.3).
    pub trigger_lapse: f64,
}

/// One of the four lbr subsystem families (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LbrFamilyStats {
    pub opens: u64,
    pub closes: u64,
    pub checkins: u64,
    pub exists: u64,
    pub reads: u64,
    pub read_bytes: u64,
    pub writes: u64,
    pub write_bytes: u64,
    pub digests: u64,
    pub filesizes: u64,
    pub modtimes: u64,
    pub copies: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LbrStats {
    pub rcs: LbrFamilyStats,
    pub binary: LbrFamilyStats,
    pub compress: LbrFamilyStats,
    pub uncompress: LbrFamilyStats,
}

/// File-transfer totals reported by a `filetotals` line (§4.3), kept
/// separately for the svr and client directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileTotals {
    pub svr_send_files: u64,
    pub svr_send_bytes: u64,
    pub svr_recv_files: u64,
    pub svr_recv_bytes: u64,
    pub client_send_files: u64,
    pub client_send_bytes: u64,
    pub client_recv_files: u64,
    pub client_recv_bytes: u64,
}

/// One p4d command lifecycle, aggregated across its request, compute-end,
/// completion, and track lines (§3 Command, §4.4).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Command {
    // Identity
    pub process_key: String,
    pub pid: u64,
    pub line_no: u64,
    /// Set when this pid recurred with a different process key in the
    /// same second; changes how `process_key` serializes (§3 Invariants).
    #[serde(skip)]
    pub duplicate_key: bool,

    // Descriptive
    pub user: String,
    pub workspace: String,
    pub ip: String,
    pub app: String,
    pub cmd: String,
    pub args: String,

    // Timing
    pub start_time: LogTime,
    pub end_time: LogTime,
    pub compute_lapse: f64,
    pub completed_lapse: f64,
    pub paused: f64,

    // Resource usage
    pub user_cpu_ms: u64,
    pub system_cpu_ms: u64,
    pub disk_in_pages: u64,
    pub disk_out_pages: u64,
    pub ipc_in: u64,
    pub ipc_out: u64,
    pub max_rss_kb: u64,
    pub page_faults: u64,
    /// From `--- memory cmd/proc MB/MB`: command's own footprint.
    pub mem_cmd_mb: u64,
    /// From the same line: the server process's footprint at the time.
    pub mem_proc_mb: u64,

    // RPC
    pub rpc_msgs_in: u64,
    pub rpc_msgs_out: u64,
    pub rpc_size_in_mb: f64,
    pub rpc_size_out_mb: f64,
    pub rpc_himark_fwd: u64,
    pub rpc_himark_rev: u64,
    pub rpc_snd_secs: f64,
    pub rpc_rcv_secs: f64,

    // Sync / network
    pub net_files_added: u64,
    pub net_files_updated: u64,
    pub net_files_deleted: u64,
    pub net_bytes_added: u64,
    pub net_bytes_updated: u64,

    pub file_totals: FileTotals,
    pub lbr: LbrStats,

    pub cmd_error: bool,
    /// Set by a `completed Xs` line. `false` at shutdown means the
    /// command never received one (§8 boundary behavior).
    pub completed: bool,

    /// Whether a track block has been merged into this command at least
    /// once. Drives several branches of the addition algorithm (§4.4) and
    /// is not part of the public record, so it does not serialize.
    #[serde(skip)]
    pub has_track_info: bool,
    /// Whether this command currently holds a running-thread slot, so
    /// emission knows whether to decrement the counter. Internal
    /// bookkeeping only.
    #[serde(skip)]
    pub counted_in_running: bool,
    /// Set when this `Command` originates from parsing a request line.
    /// Lets the aggregator tell a brand-new occurrence of a pid apart
    /// from a completion/track update addressed to an existing one, even
    /// when both hash to the same `process_key` (identical request
    /// text recurring within the same second).
    #[serde(skip)]
    pub is_fresh_request: bool,

    pub tables: BTreeMap<String, Table>,
}

impl Command {
    pub fn new(pid: u64, line_no: u64) -> Self {
        Command {
            pid,
            line_no,
            ..Default::default()
        }
    }

    /// Whether this command has any table usage beyond a bare `rdb.lbr`
    /// entry — used to distinguish real track info from a stray lbr-only
    /// block (§4.4).
    pub fn has_nontrivial_table(&self) -> bool {
        self.tables.keys().any(|k| k != "rdb.lbr")
    }

    /// The exported identity: disambiguated with the line number when
    /// `duplicate_key` is set (§3 Invariants, §4.4).
    pub fn exported_process_key(&self) -> String {
        if self.duplicate_key {
            format!("{}.{}", self.process_key, self.line_no)
        } else {
            self.process_key.clone()
        }
    }

    /// Field-wise merge of `other` into `self` per the `updateFrom` policy
    /// (§4.4): identity/descriptive/time fields fill only from blank;
    /// counters replace only if the incoming value is strictly positive;
    /// tables copy by key, last writer wins; `cmd_error` ors.
    pub fn update_from(&mut self, other: &Command) {
        if self.process_key.is_empty() {
            self.process_key = other.process_key.clone();
        }
        if self.user.is_empty() {
            self.user = other.user.clone();
        }
        if self.workspace.is_empty() {
            self.workspace = other.workspace.clone();
        }
        if self.ip.is_empty() {
            self.ip = other.ip.clone();
        }
        if self.app.is_empty() {
            self.app = other.app.clone();
        }
        if self.cmd.is_empty() {
            self.cmd = other.cmd.clone();
        }
        if self.args.is_empty() {
            self.args = other.args.clone();
        }

        self.start_time = self.start_time.or(other.start_time);
        self.end_time = self.end_time.or(other.end_time);

        macro_rules! replace_if_positive {
            ($field:ident) => {
                if other.$field > Default::default() {
                    self.$field = other.$field;
                }
            };
        }

        replace_if_positive!(compute_lapse);
        replace_if_positive!(completed_lapse);
        replace_if_positive!(paused);
        replace_if_positive!(user_cpu_ms);
        replace_if_positive!(system_cpu_ms);
        replace_if_positive!(disk_in_pages);
        replace_if_positive!(disk_out_pages);
        replace_if_positive!(ipc_in);
        replace_if_positive!(ipc_out);
        replace_if_positive!(max_rss_kb);
        replace_if_positive!(page_faults);
        replace_if_positive!(mem_cmd_mb);
        replace_if_positive!(mem_proc_mb);
        replace_if_positive!(rpc_msgs_in);
        replace_if_positive!(rpc_msgs_out);
        replace_if_positive!(rpc_size_in_mb);
        replace_if_positive!(rpc_size_out_mb);
        replace_if_positive!(rpc_himark_fwd);
        replace_if_positive!(rpc_himark_rev);
        replace_if_positive!(rpc_snd_secs);
        replace_if_positive!(rpc_rcv_secs);
        replace_if_positive!(net_files_added);
        replace_if_positive!(net_files_updated);
        replace_if_positive!(net_files_deleted);
        replace_if_positive!(net_bytes_added);
        replace_if_positive!(net_bytes_updated);

        for (name, table) in &other.tables {
            self.tables.insert(name.clone(), table.clone());
        }

        if other.file_totals != FileTotals::default() {
            self.file_totals = other.file_totals.clone();
        }
        if other.lbr != LbrStats::default() {
            self.lbr = other.lbr.clone();
        }

        self.cmd_error |= other.cmd_error;
        self.completed |= other.completed;
        self.has_track_info |= other.has_track_info;
    }
}

/// Hand-written rather than derived so the wire form carries
/// `exported_process_key()` — disambiguated with the line number when
/// `duplicate_key` is set — instead of the raw `process_key` field,
/// per the §8 uniqueness property.
impl Serialize for Command {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("Command", 42)?;
        s.serialize_field("process_key", &self.exported_process_key())?;
        s.serialize_field("pid", &self.pid)?;
        s.serialize_field("line_no", &self.line_no)?;

        s.serialize_field("user", &self.user)?;
        s.serialize_field("workspace", &self.workspace)?;
        s.serialize_field("ip", &self.ip)?;
        s.serialize_field("app", &self.app)?;
        s.serialize_field("cmd", &self.cmd)?;
        s.serialize_field("args", &self.args)?;

        s.serialize_field("start_time", &self.start_time)?;
        s.serialize_field("end_time", &self.end_time)?;
        s.serialize_field("compute_lapse", &self.compute_lapse)?;
        s.serialize_field("completed_lapse", &self.completed_lapse)?;
        s.serialize_field("paused", &self.paused)?;

        s.serialize_field("user_cpu_ms", &self.user_cpu_ms)?;
        s.serialize_field("system_cpu_ms", &self.system_cpu_ms)?;
        s.serialize_field("disk_in_pages", &self.disk_in_pages)?;
        s.serialize_field("disk_out_pages", &self.disk_out_pages)?;
        s.serialize_field("ipc_in", &self.ipc_in)?;
        s.serialize_field("ipc_out", &self.ipc_out)?;
        s.serialize_field("max_rss_kb", &self.max_rss_kb)?;
        s.serialize_field("page_faults", &self.page_faults)?;
        s.serialize_field("mem_cmd_mb", &self.mem_cmd_mb)?;
        s.serialize_field("mem_proc_mb", &self.mem_proc_mb)?;

        s.serialize_field("rpc_msgs_in", &self.rpc_msgs_in)?;
        s.serialize_field("rpc_msgs_out", &self.rpc_msgs_out)?;
        s.serialize_field("rpc_size_in_mb", &self.rpc_size_in_mb)?;
        s.serialize_field("rpc_size_out_mb", &self.rpc_size_out_mb)?;
        s.serialize_field("rpc_himark_fwd", &self.rpc_himark_fwd)?;
        s.serialize_field("rpc_himark_rev", &self.rpc_himark_rev)?;
        s.serialize_field("rpc_snd_secs", &self.rpc_snd_secs)?;
        s.serialize_field("rpc_rcv_secs", &self.rpc_rcv_secs)?;

        s.serialize_field("net_files_added", &self.net_files_added)?;
        s.serialize_field("net_files_updated", &self.net_files_updated)?;
        s.serialize_field("net_files_deleted", &self.net_files_deleted)?;
        s.serialize_field("net_bytes_added", &self.net_bytes_added)?;
        s.serialize_field("net_bytes_updated", &self.net_bytes_updated)?;

        s.serialize_field("file_totals", &self.file_totals)?;
        s.serialize_field("lbr", &self.lbr)?;

        s.serialize_field("cmd_error", &self.cmd_error)?;
        s.serialize_field("completed", &self.completed)?;

        s.serialize_field("tables", &self.tables)?;

        s.end()
    }
}

/// Snapshot at an active/paused-thread or resource-pressure line (§3
/// ServerEvent, §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    pub event_time: LogTime,
    pub line_no: u64,
    pub running_threads: u64,
    pub running_threads_max: u64,
    pub paused_threads: u64,
    pub paused_threads_max: u64,
    pub paused_error_count: u64,
    pub pause_rate_cpu: u64,
    pub pause_rate_mem: u64,
    pub cpu_pressure_state: u8,
    pub mem_pressure_state: u8,
}

/// The tagged output stream (§4/§9: "sum type so consumers pattern-match").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Record {
    Command(Command),
    ServerEvent(ServerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn zero_time_serializes_to_sentinel() {
        let t = LogTime::zero();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"0001/01/01 00:00:00\"");
        let back: LogTime = serde_json::from_str(&json).unwrap();
        assert!(back.is_zero());
    }

    #[test]
    fn set_time_round_trips() {
        let t = LogTime::from_naive(dt(2015, 9, 2, 15, 23, 9));
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, "\"2015/09/02 15:23:09\"");
        let back: LogTime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn tables_serialize_sorted_by_name() {
        let mut cmd = Command::new(1616, 1);
        cmd.tables.insert("db.user".to_string(), Table::default());
        cmd.tables.insert("db.domain".to_string(), Table::default());
        let json = serde_json::to_string(&cmd).unwrap();
        let domain_pos = json.find("db.domain").unwrap();
        let user_pos = json.find("db.user").unwrap();
        assert!(domain_pos < user_pos);
    }

    #[test]
    fn has_nontrivial_table_ignores_bare_rdb_lbr() {
        let mut cmd = Command::new(1, 1);
        cmd.tables.insert("rdb.lbr".to_string(), Table::default());
        assert!(!cmd.has_nontrivial_table());
        cmd.tables.insert("db.user".to_string(), Table::default());
        assert!(cmd.has_nontrivial_table());
    }

    #[test]
    fn update_from_fills_blanks_and_replaces_positive_counters() {
        let mut base = Command::new(1616, 10);
        base.user = "robert".to_string();
        base.compute_lapse = 0.0;

        let mut incoming = Command::new(1616, 10);
        incoming.workspace = "robert-test".to_string();
        incoming.compute_lapse = 0.031;
        incoming.cmd_error = true;

        base.update_from(&incoming);

        assert_eq!(base.user, "robert");
        assert_eq!(base.workspace, "robert-test");
        assert_eq!(base.compute_lapse, 0.031);
        assert!(base.cmd_error);
    }

    #[test]
    fn exported_process_key_disambiguates_on_duplicate() {
        let mut cmd = Command::new(4496, 42);
        cmd.process_key = "abc123".to_string();
        assert_eq!(cmd.exported_process_key(), "abc123");
        cmd.duplicate_key = true;
        assert_eq!(cmd.exported_process_key(), "abc123.42");
    }

    #[test]
    fn serialization_uses_disambiguated_process_key() {
        let mut cmd = Command::new(4496, 42);
        cmd.process_key = "abc123".to_string();
        cmd.duplicate_key = true;
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"process_key\":\"abc123.42\""));
        assert!(!json.contains("\"abc123\""), "raw process_key must not appear on its own");
    }

    #[test]
    fn record_tags_discriminate_command_and_server_event() {
        let rec = Record::Command(Command::new(1, 1));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.starts_with("{\"kind\":\"Command\""));
    }
}
