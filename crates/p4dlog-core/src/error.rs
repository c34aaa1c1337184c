//! Error types for the p4d log reconstruction engine.

/// Errors raised while configuring or driving the engine.
///
/// The hot parse path does not use this type — per the parser's error
/// handling design, bad numeric captures become zero and unrecognised
/// lines are counted, not propagated. `ParseError` covers the few things
/// that really can fail: malformed configuration and the fatal
/// running-count safety ceiling.
#[derive(Debug)]
pub enum ParseError {
    /// `debug_pid` was set without `debug_cmd`, or vice versa.
    InvalidDebugFilter(String),
    /// The running-thread count exceeded the safety ceiling (see
    /// `crate::config::MAX_RUNNING_THREADS`). Fatal: the operator must
    /// enable completion records (`configurable server=3`) or pass
    /// `no_completion_records`.
    RunningCountExceeded(u64),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidDebugFilter(msg) => write!(f, "invalid debug filter: {}", msg),
            ParseError::RunningCountExceeded(n) => write!(
                f,
                "running-thread count exceeded safety ceiling ({n}); enable completion records \
                 (configurable server=3) or pass no_completion_records"
            ),
        }
    }
}

impl std::error::Error for ParseError {}
