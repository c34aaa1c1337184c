//! Line classifier (§4.1). Pure function: decides what a raw log line is
//! before the segmenter or extractors ever look at it.

/// Prefixes that end a block but must not seed the next one.
const IGNORABLE_PREFIXES: &[&str] = &[
    "Rpc himark:",
    "server to client",
    "server to inter",
    "Forwarder set trusted client address",
    "NetSslTransport::SendOrReceive",
];

const INFO_MARKER: &str = "Perforce server info:";
const ERROR_MARKER: &str = "Perforce server error:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    BlockStartInfo,
    BlockStartError,
    ActiveThreads,
    PausedThreads,
    ResourcePressure,
    /// Ends the current block and reseeds the next one with this line.
    BlockEnd,
    /// Ends the current block but is dropped, not reseeded.
    Ignorable,
    Content,
}

/// Strips trailing CR/LF and classifies. The only allocation this
/// function ever performs is none — callers own the line's storage.
pub fn classify(line: &str) -> LineKind {
    let line = line.trim_end_matches(['\r', '\n']);

    if line == INFO_MARKER {
        return LineKind::BlockStartInfo;
    }
    if line == ERROR_MARKER {
        return LineKind::BlockStartError;
    }
    if line.ends_with(" active threads.") {
        return LineKind::ActiveThreads;
    }
    if line.ends_with(" paused threads.") {
        return LineKind::PausedThreads;
    }
    if line.contains(" Server under resource pressure.  Pause rate CPU") {
        return LineKind::ResourcePressure;
    }
    if line.is_empty() {
        return LineKind::BlockEnd;
    }
    if IGNORABLE_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return LineKind::Ignorable;
    }

    LineKind::Content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_block_start_markers() {
        assert_eq!(
            classify("Perforce server info:"),
            LineKind::BlockStartInfo
        );
        assert_eq!(
            classify("Perforce server error:"),
            LineKind::BlockStartError
        );
    }

    #[test]
    fn recognizes_server_event_lines() {
        assert_eq!(
            classify("2020/01/01 00:00:00 pid 1: 3 active threads."),
            LineKind::ActiveThreads
        );
        assert_eq!(
            classify("2020/01/01 00:00:00 pid 1: 0 paused threads."),
            LineKind::PausedThreads
        );
        assert_eq!(
            classify(
                "2020/01/01 00:00:00 pid 1056103: Server under resource pressure.  Pause rate CPU 59%, mem 0%, CPU pressure 2, mem pressure 0"
            ),
            LineKind::ResourcePressure
        );
    }

    #[test]
    fn recognizes_block_end_and_ignorable_lines() {
        assert_eq!(classify(""), LineKind::BlockEnd);
        assert_eq!(classify("Rpc himark: 123456"), LineKind::Ignorable);
        assert_eq!(
            classify("server to client rpc msgs"),
            LineKind::Ignorable
        );
    }

    #[test]
    fn trims_trailing_crlf_before_matching() {
        assert_eq!(classify("Perforce server info:\r\n"), LineKind::BlockStartInfo);
    }

    #[test]
    fn content_line_is_fallback() {
        assert_eq!(classify("\t--- db.user"), LineKind::Content);
    }
}
