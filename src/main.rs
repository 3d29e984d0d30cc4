// =============================================================================
// Penny-Basing Engine — Main Entry Point
// =============================================================================
//
// Validates configuration, opens the Alert Log, composes the Engine, spawns
// one feed task per symbol plus the tail dispatcher and heartbeat/risk loops,
// and shuts everything down cleanly on Ctrl+C. Exit codes follow the
// component design: 0 normal, 1 config error, 2 invalid URL/account id,
// 3 executor init failure, 4 feed init failure, 5 fatal runtime error.
// =============================================================================

mod alert_log;
mod book;
mod config;
mod decision_engine;
mod dispatch;
mod engine;
mod error;
mod executor;
mod feed;
mod imbalance;
mod risk;
mod state;
mod types;
mod window;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::executor::simulated::{SimulatedExecutor, SimulationConfig};
use crate::executor::OrderExecutor;
use crate::feed::QuoteCache;
use crate::state::TraderState;

/// `--dry-run` swaps the brokerage executor for the in-process simulator;
/// `--book-debug` raises the book normalizer's log level; `--KEY=VALUE`
/// overrides any numeric knob by env-var name before `EngineConfig::from_env`
/// reads it. Matches the reference engine's habit of keeping CLI parsing to
/// a short hand-rolled loop rather than pulling in an argument-parsing crate.
struct Cli {
    dry_run: bool,
    book_debug: bool,
}

fn parse_cli() -> Cli {
    let mut cli = Cli { dry_run: false, book_debug: false };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => cli.dry_run = true,
            "--book-debug" => cli.book_debug = true,
            other => {
                if let Some((key, value)) = other.trim_start_matches("--").split_once('=') {
                    std::env::set_var(key.to_uppercase(), value);
                }
            }
        }
    }
    cli
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = parse_cli();
    if cli.book_debug {
        std::env::set_var("RUST_LOG", "penny_basing_engine::book=debug,info");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("penny-basing engine starting up");

    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(err) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };
    info!(symbols = ?config.symbols, dry_run = cli.dry_run, "configuration loaded");

    if config.schwab_account_id < 0 {
        error!(account_id = config.schwab_account_id, "invalid SCHWAB_ACCOUNT_ID");
        return ExitCode::from(2);
    }

    let alert_log = match alert_log::AlertLog::open(&config.db_path) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            error!(error = %err, "failed to open alert log");
            return ExitCode::from(1);
        }
    };

    let trader_state = state::TraderState::load(&config.live_state_file).unwrap_or_else(|err| {
        warn!(error = %err, "failed to load trader state snapshot, starting flat");
        TraderState::default()
    });

    let quotes = Arc::new(QuoteCache::new());

    let executor: Arc<dyn OrderExecutor> = if cli.dry_run || config.inline_live_dry_run {
        info!("dry-run mode: orders are simulated, never sent to the brokerage");
        let quotes_for_source = quotes.clone();
        let price_source: crate::executor::simulated::PriceSource =
            Arc::new(move |symbol: &str| quotes_for_source.get(symbol));
        Arc::new(SimulatedExecutor::new(SimulationConfig::default(), price_source))
    } else {
        match executor::schwab::from_config(config.schwab_account_id, &config.schwab_token_path) {
            Ok(executor) => executor,
            Err(err) => {
                error!(error = %err, "failed to initialize brokerage executor");
                return ExitCode::from(3);
            }
        }
    };

    let engine = match Engine::new(&config, alert_log.clone(), executor, trader_state) {
        Ok(engine) => Arc::new(engine),
        Err(err) => {
            error!(error = %err, "failed to construct engine");
            return ExitCode::from(1);
        }
    };

    // --- Tail dispatcher (absent in inline-only mode) -------------------------
    let mut tail_shutdown_tx = None;
    if let Some(tail) = engine.tail_dispatcher.clone() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        tail_shutdown_tx = Some(tx);
        tokio::spawn(async move {
            tail.run(rx).await;
        });
        info!("tail dispatcher running");
    }

    // --- Per-symbol feed tasks -------------------------------------------------
    let mut feed_handles = Vec::new();
    for symbol in &config.symbols {
        let engine = engine.clone();
        let quotes = quotes.clone();
        let url = config.feed_ws_url.clone();
        let symbols = vec![symbol.clone()];
        let retries = config.feed_connect_retries;
        let backoff = config.feed_connect_backoff;
        let silence_timeout = config.feed_silence_timeout;

        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = feed::run_feed(&engine, Some(&quotes), &url, &symbols, retries, backoff, silence_timeout).await {
                    error!(symbol = %symbols[0], error = %err, "feed task ended, reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        feed_handles.push(handle);
    }

    if feed_handles.is_empty() {
        error!("no symbols configured, nothing to feed");
        return ExitCode::from(4);
    }
    info!(count = feed_handles.len(), "feed tasks launched");

    // --- Heartbeat + risk-guard kill-switch poll --------------------------------
    let heartbeat_engine = engine.clone();
    let heartbeat_sec = config.heartbeat_sec.max(1);
    let heartbeat_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_sec));
        loop {
            interval.tick().await;
            if let Err(err) = heartbeat_engine.risk.check_kill_switch() {
                error!(error = %err, event = err.event_name(), "kill switch engaged, halting");
                std::process::exit(1);
            }
            let snapshot = heartbeat_engine.risk.snapshot();
            info!(
                trades_in_window = snapshot.trades_in_window,
                max_trades_per_hour = snapshot.max_trades_per_hour,
                tripped = snapshot.tripped,
                "heartbeat"
            );
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return ExitCode::from(5);
    }
    warn!("shutdown signal received, stopping gracefully");

    heartbeat_handle.abort();
    for handle in feed_handles {
        handle.abort();
    }
    if let Some(tx) = tail_shutdown_tx {
        let _ = tx.send(());
    }

    info!("penny-basing engine shut down complete");
    ExitCode::SUCCESS
}
