//! Shared numeric parsing for field extractors: byte-suffix sizes and the
//! two lapse-value spellings (§4.3).

use tracing::warn;

/// Parses a plain integer, or one with a trailing K/M/G/T/P suffix
/// (multiplies by 1024^n). Malformed input becomes zero, per the "bad
/// number" error kind (§7) — never propagated.
pub fn parse_byte_size(s: &str) -> u64 {
    let s = s.trim();
    if s.is_empty() {
        return 0;
    }
    let mut chars = s.chars();
    let last = match chars.clone().last() {
        Some(c) => c,
        None => return 0,
    };
    let multiplier = match last {
        'K' | 'k' => 1024u64,
        'M' | 'm' => 1024 * 1024,
        'G' | 'g' => 1024 * 1024 * 1024,
        'T' | 't' => 1024u64.pow(4),
        'P' | 'p' => 1024u64.pow(5),
        _ => 1,
    };
    let digits = if multiplier != 1 {
        &s[..s.len() - last.len_utf8()]
    } else {
        s
    };
    digits.parse::<u64>().unwrap_or_else(|_| {
        warn!(input = s, "bad byte-size capture, defaulting to 0");
        0
    })
}

/// Parses a bare (non-suffixed) integer, defaulting to zero on failure.
pub fn parse_u64(s: &str) -> u64 {
    s.trim().parse::<u64>().unwrap_or_else(|_| {
        warn!(input = s, "bad integer capture, defaulting to 0");
        0
    })
}

/// Parses a lapse/seconds value in either `X.Ys` or `.Ys` form (the `s`
/// suffix, if present, must already be stripped by the caller's regex).
/// Malformed input becomes zero.
pub fn parse_lapse(s: &str) -> f64 {
    let s = s.trim();
    let normalized = if let Some(stripped) = s.strip_prefix('.') {
        format!("0.{stripped}")
    } else {
        s.to_string()
    };
    normalized.parse::<f64>().unwrap_or_else(|_| {
        warn!(input = s, "bad lapse capture, defaulting to 0.0");
        0.0
    })
}
