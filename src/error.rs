// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Each variant is one of the error kinds from the error-handling design:
// locally recoverable conditions the pipeline absorbs (ParseError, DataGap,
// FeedTimeout, ExecutorReject, LimitTimeout) and conditions that are
// surfaced and force an emergency shutdown (RateExceeded, KillSwitch,
// BadFill) or refusal to start (ConfigError).
//
// Application-level plumbing (config IO, SQLite setup, top-level `main`)
// uses `anyhow::Result` with `.context(...)`; `EngineError` converts into
// `anyhow::Error` for free via the blanket `From` impl `thiserror` derives.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to parse book payload: {0}")]
    ParseError(String),

    #[error("no trade prints for symbol {symbol} in {gap_secs}s")]
    DataGap { symbol: String, gap_secs: u64 },

    #[error("feed silent for {idle_secs}s, reconnecting")]
    FeedTimeout { idle_secs: u64 },

    #[error("executor rejected {side} {qty} {symbol}: {reason}")]
    ExecutorReject {
        symbol: String,
        side: String,
        qty: f64,
        reason: String,
    },

    #[error("limit order {order_id} timed out after {elapsed_secs}s")]
    LimitTimeout { order_id: String, elapsed_secs: u64 },

    #[error("trade rate exceeded: {count} trades in the last hour (limit {limit})")]
    RateExceeded { count: u32, limit: u32 },

    #[error("kill switch file present at {path}")]
    KillSwitch { path: String },

    #[error("bad fill detected for {symbol} at {price}: suspicious cents fraction")]
    BadFill { symbol: String, price: f64 },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    /// The stable structured-log event name for this error kind, matching
    /// the reference engine's `log_structured(event, data)` convention.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ParseError(_) => "parse_error",
            Self::DataGap { .. } => "data_gap",
            Self::FeedTimeout { .. } => "feed_timeout",
            Self::ExecutorReject { .. } => "executor_reject",
            Self::LimitTimeout { .. } => "limit_timeout",
            Self::RateExceeded { .. } => "rate_exceeded",
            Self::KillSwitch { .. } => "kill_switch",
            Self::BadFill { .. } => "bad_fill",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// Whether this error kind is locally recovered or must be surfaced to
    /// the caller as an emergency condition.
    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::RateExceeded { .. } | Self::KillSwitch { .. } | Self::BadFill { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_stable() {
        assert_eq!(EngineError::ParseError("x".into()).event_name(), "parse_error");
        assert_eq!(
            EngineError::KillSwitch { path: "/tmp/kill".into() }.event_name(),
            "kill_switch"
        );
    }

    #[test]
    fn emergency_classification() {
        assert!(EngineError::BadFill { symbol: "F".into(), price: 10.01 }.is_emergency());
        assert!(!EngineError::ParseError("x".into()).is_emergency());
        assert!(!EngineError::DataGap { symbol: "F".into(), gap_secs: 30 }.is_emergency());
    }
}
