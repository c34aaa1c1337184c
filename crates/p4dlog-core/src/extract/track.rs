//! Extractors for the `---`-prefixed track lines that follow a request
//! or completion line within a block: lapse/paused/error, table and lbr
//! statistics, rpc/memory/filetotals, and the trigger lapse pairing
//! (§4.3).

use std::sync::OnceLock;

use regex::Regex;

use crate::extract::numeric::{parse_byte_size, parse_lapse, parse_u64};
use crate::extract::request::parse_usage_fields;
use crate::model::{Command, LbrFamilyStats, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LbrFamily {
    Rcs,
    Binary,
    Compress,
    Uncompress,
}

/// Accumulates track-line effects onto a single `Command` across a
/// block. Table and lbr-family context is "open" state that later lines
/// (pages, locks, opens, reads) attach to until closed or replaced.
#[derive(Default)]
pub struct TrackState {
    table_ctx: Option<String>,
    lbr_family: Option<LbrFamily>,
    pending_trigger: Option<String>,
    pub has_track_info: bool,
    /// Set when `--- exited on fatal server error` was seen, so the
    /// caller can bump the server-event tracker's cumulative
    /// paused-error count (§4.3, §4.7).
    pub saw_fatal_error: bool,
}

impl TrackState {
    pub fn new() -> Self {
        TrackState::default()
    }

    /// Call once per block, with the trigger name parsed from its
    /// request line (if any), so a following bare `lapse Xs` line can be
    /// captured onto a synthetic `trigger_NAME` table.
    pub fn set_pending_trigger(&mut self, name: Option<String>) {
        self.pending_trigger = name;
    }

    fn table(&mut self, cmd: &mut Command) -> Option<&mut Table> {
        let name = self.table_ctx.clone()?;
        Some(cmd.tables.entry(name).or_default())
    }

    fn lbr(&mut self, cmd: &mut Command) -> Option<&mut LbrFamilyStats> {
        match self.lbr_family? {
            LbrFamily::Rcs => Some(&mut cmd.lbr.rcs),
            LbrFamily::Binary => Some(&mut cmd.lbr.binary),
            LbrFamily::Compress => Some(&mut cmd.lbr.compress),
            LbrFamily::Uncompress => Some(&mut cmd.lbr.uncompress),
        }
    }

    /// Applies one track line to `cmd`. Returns `true` if the line
    /// matched a known extractor (a parse miss is counted by the caller
    /// when this returns `false`).
    pub fn apply_line(&mut self, line: &str, cmd: &mut Command) -> bool {
        let line = line.trim();

        if let Some(name) = self.pending_trigger.take() {
            if let Some(secs) = match_prefix_capture(line, "lapse ", "s") {
                let table = cmd
                    .tables
                    .entry(format!("trigger_{name}"))
                    .or_default();
                table.trigger_lapse = parse_lapse(secs);
                self.has_track_info = true;
                return true;
            }
        }

        if let Some(rest) = line.strip_prefix("--- lapse ") {
            if let Some(secs) = rest.strip_suffix('s') {
                cmd.completed_lapse = parse_lapse(secs);
                self.has_track_info = true;
                return true;
            }
        }
        if let Some(rest) = line.strip_prefix("--- paused ") {
            if let Some(secs) = rest.strip_suffix('s') {
                cmd.paused = parse_lapse(secs);
                self.has_track_info = true;
                return true;
            }
        }
        if line == "--- exited on fatal server error" {
            cmd.cmd_error = true;
            self.saw_fatal_error = true;
            return true;
        }

        if let Some(name) = line.strip_prefix("--- db.") {
            self.table_ctx = Some(format!("db.{name}"));
            self.has_track_info = true;
            return true;
        }
        if line == "--- rdb.lbr" {
            self.table_ctx = Some("rdb.lbr".to_string());
            return true;
        }
        if let Some(caps) = storageup_re().captures(line) {
            let name = &caps["table"];
            let rw = &caps["rw"];
            self.table_ctx = Some(format!("{name}_{rw}"));
            self.has_track_info = true;
            return true;
        }
        if matches!(
            line,
            "--- meta" | "--- change" | "--- clients" | "--- clientEntity"
        ) || line.starts_with("--- replica/pull")
        {
            self.table_ctx = None;
            return true;
        }

        if let Some(caps) = usage_re().captures(line) {
            if let Some(usage) = parse_usage_fields(&caps[0]) {
                cmd.user_cpu_ms = usage.user_cpu_ms;
                cmd.system_cpu_ms = usage.system_cpu_ms;
                cmd.disk_in_pages = usage.disk_in_pages;
                cmd.disk_out_pages = usage.disk_out_pages;
                cmd.ipc_in = usage.ipc_in;
                cmd.ipc_out = usage.ipc_out;
                cmd.max_rss_kb = usage.max_rss_kb;
                cmd.page_faults = usage.page_faults;
            }
            return true;
        }

        if let Some(caps) = memory_re().captures(line) {
            cmd.mem_cmd_mb = parse_u64(&caps["cmd"]);
            cmd.mem_proc_mb = parse_u64(&caps["proc"]);
            return true;
        }

        if let Some(caps) = rpc_re().captures(line) {
            cmd.rpc_msgs_in = parse_u64(&caps["msgs_in"]);
            cmd.rpc_msgs_out = parse_u64(&caps["msgs_out"]);
            cmd.rpc_size_in_mb = caps["size_in"].parse().unwrap_or(0.0);
            cmd.rpc_size_out_mb = caps["size_out"].parse().unwrap_or(0.0);
            cmd.rpc_himark_fwd = parse_u64(&caps["fwd"]);
            cmd.rpc_himark_rev = parse_u64(&caps["rev"]);
            if let (Some(snd), Some(rcv)) = (caps.name("snd"), caps.name("rcv")) {
                cmd.rpc_snd_secs = parse_lapse(snd.as_str());
                cmd.rpc_rcv_secs = parse_lapse(rcv.as_str());
            }
            return true;
        }

        if let Some(caps) = filetotals_re().captures(line) {
            let files = parse_u64(&caps["files"]);
            let bytes = parse_byte_size(&caps["bytes"]);
            if &caps["dir"] == "svr" {
                if &caps["way"] == "send" {
                    cmd.file_totals.svr_send_files = files;
                    cmd.file_totals.svr_send_bytes = bytes;
                } else {
                    cmd.file_totals.svr_recv_files = files;
                    cmd.file_totals.svr_recv_bytes = bytes;
                }
            } else if &caps["way"] == "send" {
                cmd.file_totals.client_send_files = files;
                cmd.file_totals.client_send_bytes = bytes;
            } else {
                cmd.file_totals.client_recv_files = files;
                cmd.file_totals.client_recv_bytes = bytes;
            }
            return true;
        }

        if let Some(caps) = pages_re().captures(line) {
            self.has_track_info = true;
            if let Some(t) = self.table(cmd) {
                t.pages_in = parse_u64(&caps["pin"]);
                t.pages_out = parse_u64(&caps["pout"]);
                t.pages_cached = parse_u64(&caps["pcached"]);
            }
            return true;
        }
        if let Some(caps) = pages_split_re().captures(line) {
            if let Some(t) = self.table(cmd) {
                t.pages_split_internal = parse_u64(&caps["internal"]);
                t.pages_split_leaf = parse_u64(&caps["leaf"]);
            }
            return true;
        }
        if let Some(caps) = locks_rows_re().captures(line) {
            self.has_track_info = true;
            if let Some(t) = self.table(cmd) {
                t.read_locks = parse_u64(&caps["rlocks"]);
                t.write_locks = parse_u64(&caps["wlocks"]);
                t.get_rows = parse_u64(&caps["get"]);
                t.pos_rows = parse_u64(&caps["pos"]);
                t.scan_rows = parse_u64(&caps["scan"]);
                t.put_rows = parse_u64(&caps["put"]);
                t.del_rows = parse_u64(&caps["del"]);
            }
            return true;
        }
        if let Some(caps) = total_lock_re().captures(line) {
            if let Some(t) = self.table(cmd) {
                t.total_read_wait_ms = parse_u64(&caps["rwait"]);
                t.total_read_held_ms = parse_u64(&caps["rheld"]);
                t.total_write_wait_ms = parse_u64(&caps["wwait"]);
                t.total_write_held_ms = parse_u64(&caps["wheld"]);
            }
            return true;
        }
        if let Some(caps) = max_lock_re().captures(line) {
            if let Some(t) = self.table(cmd) {
                t.max_read_wait_ms = parse_u64(&caps["rwait"]);
                t.max_read_held_ms = parse_u64(&caps["rheld"]);
                t.max_write_wait_ms = parse_u64(&caps["wwait"]);
                t.max_write_held_ms = parse_u64(&caps["wheld"]);
            }
            return true;
        }
        if let Some(caps) = peek_re().captures(line) {
            if let Some(t) = self.table(cmd) {
                t.peek_count = parse_u64(&caps["count"]);
                t.peek_wait_ms = parse_u64(&caps["wait_total"]);
                t.peek_held_ms = parse_u64(&caps["held_total"]);
                t.max_peek_wait_ms = parse_u64(&caps["wait_max"]);
                t.max_peek_held_ms = parse_u64(&caps["held_max"]);
            }
            return true;
        }

        if let Some(caps) = lbr_family_re().captures(line) {
            self.lbr_family = Some(match &caps["family"] {
                "Rcs" => LbrFamily::Rcs,
                "Binary" => LbrFamily::Binary,
                "Compress" => LbrFamily::Compress,
                _ => LbrFamily::Uncompress,
            });
            return true;
        }
        if let Some(caps) = lbr_opens_re().captures(line) {
            self.has_track_info = true;
            if let Some(f) = self.lbr(cmd) {
                f.opens = parse_u64(&caps["opens"]);
                f.closes = parse_u64(&caps["closes"]);
                f.checkins = parse_u64(&caps["checkins"]);
                f.exists = parse_u64(&caps["exists"]);
            }
            return true;
        }
        if let Some(caps) = lbr_rw_re().captures(line) {
            if let Some(f) = self.lbr(cmd) {
                f.reads = parse_u64(&caps["reads"]);
                f.read_bytes = parse_byte_size(&caps["readbytes"]);
                f.writes = parse_u64(&caps["writes"]);
                f.write_bytes = parse_byte_size(&caps["writebytes"]);
            }
            return true;
        }
        if let Some(caps) = lbr_digests_re().captures(line) {
            if let Some(f) = self.lbr(cmd) {
                f.digests = parse_u64(&caps["digests"]);
                f.filesizes = parse_u64(&caps["filesizes"]);
                f.modtimes = parse_u64(&caps["modtimes"]);
                f.copies = parse_u64(&caps["copies"]);
            }
            return true;
        }

        false
    }
}

fn match_prefix_capture<'a>(line: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).and_then(|r| r.strip_suffix(suffix))
}

macro_rules! regex_fn {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pat).unwrap())
        }
    };
}

regex_fn!(
    storageup_re,
    r"^--- storageup/(?P<table>\S+?)(?P<rw>[RW])$"
);
regex_fn!(
    usage_re,
    r"^--- usage (\d+\+\d+us \d+\+\d+io \d+\+\d+net \S+k \d+pf)$"
);
regex_fn!(
    memory_re,
    r"^--- memory cmd/proc (?P<cmd>\d+)MB/(?P<proc>\d+)MB$"
);
regex_fn!(
    rpc_re,
    r"^--- rpc msgs/size in\+out (?P<msgs_in>\d+)\+(?P<msgs_out>\d+)/(?P<size_in>[\d.]+)mb\+(?P<size_out>[\d.]+)mb himarks (?P<fwd>\d+)/(?P<rev>\d+)(?: snd/rcv (?P<snd>[\d.]+)s/(?P<rcv>[\d.]+)s)?$"
);
regex_fn!(
    filetotals_re,
    r"^--- filetotals (?P<dir>svr|client) (?P<way>send|recv) (?P<files>\d+)files\+(?P<bytes>\S+)bytes$"
);
regex_fn!(
    pages_re,
    r"^---\s+pages in\+out\+cached (?P<pin>\d+)\+(?P<pout>\d+)\+(?P<pcached>\d+)$"
);
regex_fn!(
    pages_split_re,
    r"^---\s+pages split internal\+leaf (?P<internal>\d+)\+(?P<leaf>\d+)$"
);
regex_fn!(
    locks_rows_re,
    r"^---\s+locks read/write (?P<rlocks>\d+)/(?P<wlocks>\d+) rows get\+pos\+scan (?P<get>\d+)\+(?P<pos>\d+)\+(?P<scan>\d+) put\+del (?P<put>\d+)\+(?P<del>\d+)$"
);
regex_fn!(
    total_lock_re,
    r"^---\s+total lock wait\+held read/write (?P<rwait>\d+)\+(?P<rheld>\d+)/(?P<wwait>\d+)\+(?P<wheld>\d+)$"
);
regex_fn!(
    max_lock_re,
    r"^---\s+(?:max lock|locks) wait\+held read/write (?P<rwait>\d+)\+(?P<rheld>\d+)/(?P<wwait>\d+)\+(?P<wheld>\d+)$"
);
regex_fn!(
    peek_re,
    r"^---\s+peek count (?P<count>\d+) wait\+held total/max (?P<wait_total>\d+)\+(?P<held_total>\d+)/(?P<wait_max>\d+)\+(?P<held_max>\d+)$"
);
regex_fn!(lbr_family_re, r"^--- lbr (?P<family>Rcs|Binary|Compress|Uncompress)$");
regex_fn!(
    lbr_opens_re,
    r"^---\s+opens\+closes\+checkins\+exists (?P<opens>\d+)\+(?P<closes>\d+)\+(?P<checkins>\d+)\+(?P<exists>\d+)$"
);
regex_fn!(
    lbr_rw_re,
    r"^---\s+reads\+readbytes\+writes\+writebytes (?P<reads>\d+)\+(?P<readbytes>\S+)\+(?P<writes>\d+)\+(?P<writebytes>\S+)$"
);
regex_fn!(
    lbr_digests_re,
    r"^---\s+digests\+filesizes\+modtimes\+copies (?P<digests>\d+)\+(?P<filesizes>\d+)\+(?P<modtimes>\d+)\+(?P<copies>\d+)$"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lapse_line_sets_completed_lapse() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        assert!(st.apply_line("--- lapse .044s", &mut cmd));
        assert_eq!(cmd.completed_lapse, 0.044);
        assert!(st.has_track_info);
    }

    #[test]
    fn db_table_context_then_pages_line_attaches_to_table() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        assert!(st.apply_line("--- db.user", &mut cmd));
        assert!(st.apply_line("---   pages in+out+cached 1+2+3", &mut cmd));
        let table = cmd.tables.get("db.user").unwrap();
        assert_eq!(table.pages_in, 1);
        assert_eq!(table.pages_out, 2);
        assert_eq!(table.pages_cached, 3);
    }

    #[test]
    fn rdb_lbr_context_does_not_mark_track_info_alone() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        assert!(st.apply_line("--- rdb.lbr", &mut cmd));
        assert!(!st.has_track_info);
        assert!(!cmd.has_nontrivial_table());
    }

    #[test]
    fn trigger_lapse_attaches_to_synthetic_table() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        st.set_pending_trigger(Some("swarm.changesave".to_string()));
        assert!(st.apply_line("lapse .044s", &mut cmd));
        let table = cmd.tables.get("trigger_swarm.changesave").unwrap();
        assert_eq!(table.trigger_lapse, 0.044);
    }

    #[test]
    fn lbr_family_context_then_opens_line() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        assert!(st.apply_line("--- lbr Rcs", &mut cmd));
        assert!(st.apply_line("---   opens+closes+checkins+exists 1+2+3+4", &mut cmd));
        assert_eq!(cmd.lbr.rcs.opens, 1);
        assert_eq!(cmd.lbr.rcs.exists, 4);
    }

    #[test]
    fn lbr_read_write_bytes_parse_suffix() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        st.apply_line("--- lbr Binary", &mut cmd);
        assert!(st.apply_line(
            "---   reads+readbytes+writes+writebytes 2+4K+1+2M",
            &mut cmd
        ));
        assert_eq!(cmd.lbr.binary.read_bytes, 4 * 1024);
        assert_eq!(cmd.lbr.binary.write_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn close_context_keywords_clear_table_ctx() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        st.apply_line("--- db.user", &mut cmd);
        assert!(st.apply_line("--- meta", &mut cmd));
        assert!(st.table_ctx.is_none());
    }

    #[test]
    fn unrecognized_line_returns_false() {
        let mut cmd = Command::new(1, 1);
        let mut st = TrackState::new();
        assert!(!st.apply_line("--- some-unknown-future-line", &mut cmd));
    }
}
