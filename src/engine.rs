// =============================================================================
// Engine — per-process composition root
// =============================================================================
//
// Generalizes the reference engine's `AppState` composition pattern (every
// subsystem reachable off one struct, shared via `Arc`) to this system's
// components: the Imbalance Detector owns all per-symbol rolling state, the
// Alert Log is the one shared-mutable resource, and the Dispatch Bus hands
// alerts to the Trade Decision Engine either inline or via the tail consumer
// — never both for the same alert.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::alert_log::{Alert, AlertLog};
use crate::config::EngineConfig;
use crate::decision_engine::DecisionEngine;
use crate::dispatch::{AlertSink, InlineDispatcher, TailDispatcher};
use crate::executor::controller::ExecutionParams;
use crate::executor::OrderExecutor;
use crate::imbalance::{AlertCandidate, Detector, DetectorParams, L1Quote};
use crate::risk::RiskGuard;
use crate::state::TraderState;

/// Everything one running process needs, composed once at startup and
/// shared across the per-symbol feed tasks, the tail dispatcher, and the
/// heartbeat/risk loops in the supervisor.
pub struct Engine {
    detector: Mutex<Detector>,
    alert_log: Arc<AlertLog>,
    inline_dispatcher: Option<InlineDispatcher>,
    inline_only: bool,
    local_id_counter: AtomicI64,
    pub decision_engine: Arc<DecisionEngine>,
    pub risk: Arc<RiskGuard>,
    pub tail_dispatcher: Option<Arc<TailDispatcher>>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        alert_log: Arc<AlertLog>,
        executor: Arc<dyn OrderExecutor>,
        trader_state: TraderState,
    ) -> rusqlite::Result<Self> {
        let detector_params = DetectorParams {
            window_seconds: config.window_seconds,
            min_ask_heavy: config.min_ask_heavy,
            min_bid_heavy: config.min_bid_heavy,
            max_range_cents: config.max_range_cents,
            alert_throttle_sec: config.alert_throttle_sec,
            min_volume: config.min_volume,
            min_imbalance_duration_sec: config.min_imbalance_duration_sec,
            disable_bid_heavy: false,
        };

        let risk = Arc::new(RiskGuard::new(config.live_max_trades_per_hour, config.live_kill_switch_file.clone()));

        let execution_params = ExecutionParams {
            prefer_limit_orders: config.live_prefer_limit_orders,
            limit_slippage_bps: config.live_limit_slippage_bps,
            limit_fill_timeout: config.live_limit_fill_timeout,
            limit_fill_poll_interval: config.live_limit_fill_poll_interval,
            timeout_policy: config.live_limit_timeout_policy,
        };

        let last_alert_id = trader_state.last_alert_id;
        let decision_engine = Arc::new(DecisionEngine::new(
            executor,
            alert_log.clone(),
            risk.clone(),
            execution_params,
            config.live_position_size,
            config.live_short_size,
            config.live_state_file.clone(),
            trader_state,
        ));

        // Inline and tail must never act on the same alert (§4.5): inline is
        // the sole delivery path in inline-only mode, and tail is the sole
        // path otherwise.
        let inline_dispatcher = if config.inline_dispatch_only {
            Some(InlineDispatcher::new(decision_engine.clone() as Arc<dyn AlertSink>, config.inline_dispatch_only))
        } else {
            None
        };

        let tail_dispatcher = if config.inline_dispatch_only {
            None
        } else {
            Some(Arc::new(TailDispatcher::new(
                alert_log.clone(),
                decision_engine.clone() as Arc<dyn AlertSink>,
                last_alert_id,
            )))
        };

        let local_id_counter = AtomicI64::new(alert_log.max_id()?);

        Ok(Self {
            detector: Mutex::new(Detector::new(detector_params)),
            alert_log,
            inline_dispatcher,
            inline_only: config.inline_dispatch_only,
            local_id_counter,
            decision_engine,
            risk,
            tail_dispatcher,
        })
    }

    pub fn update_l1(&self, symbol: &str, quote: L1Quote) {
        self.detector.lock().update_l1(symbol, quote);
    }

    pub fn feed_trade(&self, symbol: &str, ts: Instant, price: f64, size: u64) {
        self.detector.lock().feed_trade(symbol, ts, price, size);
    }

    pub fn feed_chart_bar(&self, symbol: &str, ts: Instant, price: f64, cum_volume: i64) {
        self.detector.lock().feed_chart_bar(symbol, ts, price, cum_volume);
    }

    /// Last-resolved price for `symbol`, used to seed the simulated
    /// executor's price source in dry-run mode.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.detector.lock().last_price(symbol)
    }

    /// Reserve the next alert id: from the Alert Log's rowid sequence in
    /// normal/tail mode, or a local counter in inline-only mode where no row
    /// is ever inserted (so `MAX(rowid)+1` would never advance).
    fn next_id(&self) -> rusqlite::Result<i64> {
        if self.inline_only {
            Ok(self.local_id_counter.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            self.alert_log.reserve_id()
        }
    }

    /// Process one incoming L2 book tick, dispatching an alert if the
    /// detector's gating conditions all hold. `now_wall` is the wall-clock
    /// timestamp (seconds) stamped on the alert; `now_instant` drives the
    /// detector's dwell/throttle/window arithmetic.
    #[instrument(skip(self, payload), name = "engine_handle_book", fields(symbol))]
    pub fn handle_book(&self, symbol: &str, payload: &Value, now_instant: Instant, now_wall: f64) {
        let candidate = self.detector.lock().process_book(symbol, payload, now_instant);
        let Some(candidate) = candidate else { return };
        if let Err(err) = self.emit_alert(candidate, now_wall) {
            warn!(symbol, error = %err, "failed to emit alert");
        }
    }

    fn emit_alert(&self, candidate: AlertCandidate, timestamp: f64) -> rusqlite::Result<()> {
        let id = self.next_id()?;
        let alert = to_alert(id, &candidate, timestamp);

        info!(
            alert_id = id,
            symbol = %alert.symbol,
            direction = %alert.direction,
            ratio = alert.ratio,
            price = alert.price,
            "alert emitted"
        );

        if let Some(inline) = &self.inline_dispatcher {
            inline.dispatch(alert.clone());
        }

        if !self.inline_only {
            self.alert_log.append_with_id(id, &candidate, timestamp)?;
        }

        Ok(())
    }
}

fn to_alert(id: i64, candidate: &AlertCandidate, timestamp: f64) -> Alert {
    Alert {
        id,
        timestamp,
        symbol: candidate.symbol.clone(),
        direction: candidate.direction,
        ratio: candidate.ratio,
        total_bids: candidate.total_bids,
        total_asks: candidate.total_asks,
        heavy_venues: candidate.heavy_venues,
        price: candidate.price,
        exchanges: candidate.exchanges.iter().map(|v| v.as_str().to_string()).collect(),
    }
}
