// =============================================================================
// Engine Configuration — environment-driven startup configuration
// =============================================================================
//
// Every tunable lives here, loaded once from the process environment at
// startup (via `dotenv` for local `.env` files, same as the reference
// engine's `main.rs`). Numeric/duration knobs fall back to a documented
// default with a warning when absent or unparsable; the brokerage
// credentials are the only fields whose absence is a hard `ConfigError`.
// =============================================================================

use std::time::Duration;

use tracing::warn;

use crate::error::EngineError;
use crate::types::TimeoutPolicy;

// =============================================================================
// Env parsing helpers
// =============================================================================
//
// Generalizes the reference engine's `_get_int_env` / `_bool_env` /
// `_get_float_env` / `_parse_symbols_from_env` helpers into small typed
// Rust functions used uniformly across every field below.

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, default, "failed to parse env var as u32, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, default, "failed to parse env var as u64, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, default, "failed to parse env var as f64, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %v, default, "failed to parse env var as bool, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

fn env_symbol_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => {
            let symbols: Vec<String> = v
                .split(|c: char| c == ',' || c.is_whitespace())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_uppercase())
                .collect();
            if symbols.is_empty() {
                default.iter().map(|s| s.to_string()).collect()
            } else {
                symbols
            }
        }
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_timeout_policy(key: &str, default: TimeoutPolicy) -> TimeoutPolicy {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "failed to parse timeout policy, using default");
            default
        }),
        Err(_) => default,
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration, assembled once from the environment at
/// process startup.
pub struct EngineConfig {
    // --- Brokerage credentials (external collaborator handles refresh) -----
    pub schwab_client_id: String,
    pub schwab_app_secret: String,
    pub schwab_redirect_uri: String,
    pub schwab_token_path: String,
    pub schwab_account_id: i64,

    // --- Storage -------------------------------------------------------------
    pub db_path: String,

    // --- Symbols & windowing ---------------------------------------------------
    pub symbols: Vec<String>,
    pub window_seconds: u64,
    pub heartbeat_sec: u64,

    // --- Streaming feed ----------------------------------------------------------
    pub feed_ws_url: String,
    pub feed_connect_retries: u32,
    pub feed_connect_backoff: Duration,
    pub feed_silence_timeout: Duration,

    // --- Imbalance gating ------------------------------------------------------
    pub min_ask_heavy: u32,
    pub min_bid_heavy: u32,
    pub max_range_cents: u32,
    pub alert_throttle_sec: u64,
    pub min_volume: f64,
    pub min_imbalance_duration_sec: u64,

    // --- Trade Decision Engine sizing ------------------------------------------
    pub live_position_size: f64,
    pub live_short_size: f64,

    // --- Order Executor ----------------------------------------------------------
    pub live_poll_interval: Duration,
    pub live_state_file: String,
    pub live_prefer_limit_orders: bool,
    pub live_limit_slippage_bps: f64,
    pub live_limit_fill_timeout: Duration,
    pub live_limit_fill_poll_interval: Duration,
    pub live_limit_timeout_policy: TimeoutPolicy,

    // --- Risk Guard --------------------------------------------------------------
    pub live_kill_switch_file: String,
    pub live_max_trades_per_hour: u32,

    // --- Dispatch Bus --------------------------------------------------------------
    pub inline_dispatch_only: bool,
    pub inline_live_dry_run: bool,
}

impl EngineConfig {
    /// Build the configuration from the process environment. `.env` should
    /// already have been loaded by the caller (see `main.rs`).
    pub fn from_env() -> Result<Self, EngineError> {
        let schwab_client_id = std::env::var("SCHWAB_CLIENT_ID")
            .map_err(|_| EngineError::ConfigError("SCHWAB_CLIENT_ID is required".into()))?;
        let schwab_app_secret = std::env::var("SCHWAB_APP_SECRET")
            .map_err(|_| EngineError::ConfigError("SCHWAB_APP_SECRET is required".into()))?;

        let schwab_redirect_uri = normalize_redirect_uri(&env_string(
            "SCHWAB_REDIRECT_URI",
            "https://127.0.0.1:8182/",
        ))?;

        let schwab_account_id: i64 = env_string("SCHWAB_ACCOUNT_ID", "0")
            .trim()
            .parse()
            .map_err(|_| EngineError::ConfigError("SCHWAB_ACCOUNT_ID must be an integer".into()))?;

        // LIVE_FLIP_SIZE, when set, is an alias for LIVE_SHORT_SIZE (first one
        // present wins) — see the design-notes resolution of the spec's open
        // question about the two knobs.
        let live_short_size = match std::env::var("LIVE_SHORT_SIZE") {
            Ok(v) => v.trim().parse().unwrap_or(1000.0),
            Err(_) => env_f64("LIVE_FLIP_SIZE", 1000.0),
        };

        Ok(Self {
            schwab_client_id,
            schwab_app_secret,
            schwab_redirect_uri,
            schwab_token_path: env_string("SCHWAB_TOKEN_PATH", "schwab_token.json"),
            schwab_account_id,

            db_path: env_string("DB_PATH", "alerts.db"),

            symbols: env_symbol_list("SYMBOLS", &["SPY"]),
            window_seconds: env_u64("WINDOW_SECONDS", 60),
            heartbeat_sec: env_u64("HEARTBEAT_SEC", 30),

            feed_ws_url: env_string("FEED_WS_URL", "wss://streamer.schwab.com/ws"),
            feed_connect_retries: env_u32("FEED_CONNECT_RETRIES", 3),
            feed_connect_backoff: env_duration_secs("FEED_CONNECT_BACKOFF_SEC", 5),
            feed_silence_timeout: env_duration_secs("FEED_SILENCE_TIMEOUT_SEC", 30),

            min_ask_heavy: env_u32("MIN_ASK_HEAVY", 6),
            min_bid_heavy: env_u32("MIN_BID_HEAVY", 6),
            max_range_cents: env_u32("MAX_RANGE_CENTS", 1),
            alert_throttle_sec: env_u64("ALERT_THROTTLE_SEC", 60),
            min_volume: env_f64("MIN_VOLUME", 100_000.0),
            min_imbalance_duration_sec: env_u64("MIN_IMBALANCE_DURATION_SEC", 10),

            live_position_size: env_f64("LIVE_POSITION_SIZE", 1000.0),
            live_short_size,

            live_poll_interval: env_duration_secs("LIVE_POLL_INTERVAL", 5),
            live_state_file: env_string("LIVE_STATE_FILE", "live_state.json"),
            live_prefer_limit_orders: env_bool("LIVE_PREFER_LIMIT_ORDERS", true),
            live_limit_slippage_bps: env_f64("LIVE_LIMIT_SLIPPAGE_BPS", 10.0),
            live_limit_fill_timeout: env_duration_secs("LIVE_LIMIT_FILL_TIMEOUT", 30),
            live_limit_fill_poll_interval: env_duration_secs("LIVE_LIMIT_FILL_POLL_INTERVAL", 2),
            live_limit_timeout_policy: env_timeout_policy(
                "LIVE_LIMIT_TIMEOUT_POLICY",
                TimeoutPolicy::Market,
            ),

            live_kill_switch_file: env_string("LIVE_KILL_SWITCH_FILE", "KILL_SWITCH"),
            live_max_trades_per_hour: env_u32("LIVE_MAX_TRADES_PER_HOUR", 20),

            inline_dispatch_only: env_bool("INLINE_DISPATCH_ONLY", false),
            inline_live_dry_run: env_bool("INLINE_LIVE_DRY_RUN", false),
        })
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("schwab_client_id", &"<redacted>")
            .field("schwab_app_secret", &"<redacted>")
            .field("schwab_redirect_uri", &self.schwab_redirect_uri)
            .field("schwab_account_id", &self.schwab_account_id)
            .field("db_path", &self.db_path)
            .field("symbols", &self.symbols)
            .field("window_seconds", &self.window_seconds)
            .field("feed_ws_url", &self.feed_ws_url)
            .field("live_position_size", &self.live_position_size)
            .field("live_short_size", &self.live_short_size)
            .field("live_limit_timeout_policy", &self.live_limit_timeout_policy)
            .finish()
    }
}

/// Validate and normalize a redirect URI: must be `http(s)://host[:port]/`,
/// trailing slash enforced.
fn normalize_redirect_uri(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(EngineError::ConfigError(format!(
            "SCHWAB_REDIRECT_URI must start with http:// or https://, got '{trimmed}'"
        )));
    }
    if trimmed.ends_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/"))
    }
}
