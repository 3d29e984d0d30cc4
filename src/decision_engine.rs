// =============================================================================
// Trade Decision Engine — flip-only per-symbol position state machine
// =============================================================================
//
// Consumes alerts (inline from the detector, or from the tail dispatcher)
// and drives position transitions through the Execution Controller. The
// whole thing is serialized behind one `tokio::sync::Mutex` — the lock must
// be held across the `.await` points inside `execute_leg`, which rules out
// `parking_lot`'s sync mutex here (the one place in this codebase where the
// async-aware lock from the reference engine's stream-task bodies is the
// right tool, not the sync one `alert_log.rs`/`risk.rs` use elsewhere).
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::alert_log::{Alert, AlertLog, OrderRecord};
use crate::dispatch::AlertSink;
use crate::error::EngineError;
use crate::executor::controller::{execute_leg, ExecutionParams};
use crate::executor::OrderExecutor;
use crate::risk::RiskGuard;
use crate::state::TraderState;
use crate::types::{Direction, OrderStatus, Side};

/// An order leg still working when the engine last touched this symbol.
/// Reconciled against the executor before acting on a new alert per §4.6.
struct OutstandingLimit {
    order_id: String,
    side: Side,
    qty: f64,
}

struct Inner {
    trader_state: TraderState,
    outstanding: HashMap<String, OutstandingLimit>,
}

pub struct DecisionEngine {
    inner: Mutex<Inner>,
    executor: Arc<dyn OrderExecutor>,
    alert_log: Arc<AlertLog>,
    risk: Arc<RiskGuard>,
    execution_params: ExecutionParams,
    position_size: f64,
    short_size: f64,
    state_path: PathBuf,
}

impl DecisionEngine {
    pub fn new(
        executor: Arc<dyn OrderExecutor>,
        alert_log: Arc<AlertLog>,
        risk: Arc<RiskGuard>,
        execution_params: ExecutionParams,
        position_size: f64,
        short_size: f64,
        state_path: impl Into<PathBuf>,
        trader_state: TraderState,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner { trader_state, outstanding: HashMap::new() }),
            executor,
            alert_log,
            risk,
            execution_params,
            position_size,
            short_size,
            state_path: state_path.into(),
        }
    }

    pub async fn current_position(&self, symbol: &str) -> f64 {
        self.inner.lock().await.trader_state.position_of(symbol)
    }

    pub async fn last_alert_id(&self) -> i64 {
        self.inner.lock().await.trader_state.last_alert_id
    }

    /// Process one alert against the flip-only state machine in §4.6.
    /// Holds the engine's lock for the entire duration so alerts are
    /// serialized; returns the terminal error, if any, so the caller (the
    /// supervisor) can decide whether to engage the Risk Guard.
    #[instrument(skip(self, alert), name = "process_alert", fields(alert_id = alert.id, symbol = %alert.symbol, direction = %alert.direction))]
    pub async fn process_alert(&self, alert: &Alert) -> Result<(), EngineError> {
        if let Err(err) = self.risk.check_kill_switch() {
            return Err(err);
        }

        let mut guard = self.inner.lock().await;

        if let Some(working) = guard.outstanding.get(&alert.symbol) {
            let order_id = working.order_id.clone();
            match self.executor.fetch_order_status(&order_id).await {
                Ok(report) if !report.status.is_terminal() => {
                    info!(symbol = %alert.symbol, order_id, "skipping alert, outstanding limit still working");
                    guard.trader_state.last_alert_id = alert.id;
                    return Ok(());
                }
                Ok(_) => {
                    guard.outstanding.remove(&alert.symbol);
                }
                Err(err) => {
                    warn!(symbol = %alert.symbol, order_id, error = %err, "failed to reconcile outstanding limit, proceeding cautiously");
                    guard.outstanding.remove(&alert.symbol);
                }
            }
        }

        let current = guard.trader_state.position_of(&alert.symbol);
        let result = self.run_transition(&mut guard, alert, current).await;
        guard.trader_state.last_alert_id = alert.id;

        if let Err(err) = guard.trader_state.save(&self.state_path) {
            warn!(error = %err, "failed to persist trader state after alert");
        }

        result
    }

    async fn run_transition(&self, guard: &mut Inner, alert: &Alert, current: f64) -> Result<(), EngineError> {
        match alert.direction {
            Direction::AskHeavy => {
                if current < 0.0 {
                    return Ok(()); // already Short: skip
                }
                if current == 0.0 {
                    self.submit_leg(guard, alert, Side::Short, self.short_size).await?;
                    return Ok(());
                }
                // Long: close first, only open Short if the close fills.
                let closed = self.submit_leg(guard, alert, Side::Sell, current).await?;
                if closed {
                    self.submit_leg(guard, alert, Side::Short, self.short_size).await?;
                }
                Ok(())
            }
            Direction::BidHeavy => {
                if current > 0.0 {
                    return Ok(()); // already Long: skip
                }
                if current == 0.0 {
                    self.submit_leg(guard, alert, Side::Buy, self.position_size).await?;
                    return Ok(());
                }
                let closed = self.submit_leg(guard, alert, Side::Cover, current.abs()).await?;
                if closed {
                    self.submit_leg(guard, alert, Side::Buy, self.position_size).await?;
                }
                Ok(())
            }
        }
    }

    /// Submit and drive one leg through the Execution Controller, update
    /// position/order-audit state, and record the trade for the Risk
    /// Guard's rate limiter. Returns whether the leg filled.
    async fn submit_leg(&self, guard: &mut Inner, alert: &Alert, side: Side, qty: f64) -> Result<bool, EngineError> {
        if qty <= 0.0 {
            return Ok(true);
        }

        guard.outstanding.insert(
            alert.symbol.clone(),
            OutstandingLimit { order_id: String::new(), side, qty },
        );

        let outcome = execute_leg(&self.executor, &self.execution_params, &alert.symbol, side, qty, alert.price).await;

        match outcome {
            Ok(leg) => {
                guard.outstanding.remove(&alert.symbol);
                if leg.filled_quantity > 0.0 {
                    guard.trader_state.apply_delta(&alert.symbol, side.position_sign() * leg.filled_quantity);
                }

                let record = OrderRecord {
                    alert_id: alert.id,
                    order_id: String::new(),
                    symbol: alert.symbol.clone(),
                    side,
                    qty: leg.filled_quantity,
                    price: leg.avg_fill_price,
                    status: leg.status,
                    timestamp: alert.timestamp,
                };
                if let Err(err) = self.alert_log.record_order(&record) {
                    warn!(error = %err, "failed to persist order audit row");
                }

                if leg.status == OrderStatus::Filled {
                    if let Err(err) = self.risk.record_fill(std::time::Instant::now()) {
                        self.risk
                            .emergency_shutdown(&self.executor, &mut guard.trader_state, &self.state_path, "rate exceeded")
                            .await;
                        #[allow(unreachable_code)]
                        return Err(err);
                    }
                }

                Ok(leg.filled())
            }
            Err(err) if err.is_emergency() => {
                self.risk
                    .emergency_shutdown(&self.executor, &mut guard.trader_state, &self.state_path, &err.to_string())
                    .await
            }
            Err(err) => {
                guard.outstanding.remove(&alert.symbol);
                warn!(symbol = %alert.symbol, %side, qty, error = %err, "leg did not fill");
                Ok(false)
            }
        }
    }
}

/// `AlertSink` impl so the Dispatch Bus (inline or tail) can hand alerts
/// straight to the engine without the caller knowing which delivery mode is
/// active.
impl AlertSink for DecisionEngine {
    fn handle<'a>(&'a self, alert: Alert) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(err) = self.process_alert(&alert).await {
                warn!(alert_id = alert.id, error = %err, event = err.event_name(), "process_alert returned an error");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{OrderResult, OrderStatusReport, Quote};
    use crate::types::Direction;
    use std::time::Duration;

    struct FillImmediatelyExecutor;

    #[async_trait::async_trait]
    impl OrderExecutor for FillImmediatelyExecutor {
        async fn submit_market(&self, _symbol: &str, side: Side, qty: f64) -> anyhow::Result<OrderResult> {
            Ok(OrderResult { order_id: "o-1".into(), status: OrderStatus::Filled, filled_quantity: qty, avg_fill_price: 13.40, raw: String::new() })
        }
        async fn submit_limit(&self, _symbol: &str, _side: Side, qty: f64, limit_price: f64) -> anyhow::Result<OrderResult> {
            Ok(OrderResult { order_id: "o-1".into(), status: OrderStatus::Filled, filled_quantity: qty, avg_fill_price: limit_price, raw: String::new() })
        }
        async fn fetch_order_status(&self, _order_id: &str) -> anyhow::Result<OrderStatusReport> {
            Ok(OrderStatusReport { status: OrderStatus::Filled, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() })
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn cancel_all_orders(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn fetch_quote(&self, _symbol: &str) -> anyhow::Result<Option<Quote>> {
            Ok(Some(Quote { bid: Some(13.40), ask: Some(13.4134), last: Some(13.40) }))
        }
    }

    fn params() -> ExecutionParams {
        ExecutionParams {
            prefer_limit_orders: true,
            limit_slippage_bps: 10.0,
            limit_fill_timeout: Duration::from_secs(1),
            limit_fill_poll_interval: Duration::from_millis(10),
            timeout_policy: crate::types::TimeoutPolicy::Market,
        }
    }

    fn test_engine(state: TraderState) -> DecisionEngine {
        let executor: Arc<dyn OrderExecutor> = Arc::new(FillImmediatelyExecutor);
        let alert_log = Arc::new(AlertLog::open(":memory:").unwrap());
        let risk = Arc::new(RiskGuard::new(1000, "/nonexistent/kill-switch-for-decision-tests"));
        DecisionEngine::new(executor, alert_log, risk, params(), 1000.0, 1000.0, "/tmp/decision-engine-test-state.json", state)
    }

    fn alert(id: i64, symbol: &str, direction: Direction, price: f64) -> Alert {
        Alert {
            id,
            timestamp: 1.0,
            symbol: symbol.to_string(),
            direction,
            ratio: 6.0,
            total_bids: 100,
            total_asks: 600,
            heavy_venues: 6,
            price,
            exchanges: vec!["NYSE".into()],
        }
    }

    #[tokio::test]
    async fn s1_flat_to_short_on_ask_heavy() {
        let engine = test_engine(TraderState::default());
        engine.process_alert(&alert(1, "F", Direction::AskHeavy, 13.35)).await.unwrap();
        assert_eq!(engine.current_position("F").await, -1000.0);
    }

    // S2 — Bid-heavy flip from short to long.
    #[tokio::test]
    async fn s2_bid_heavy_flip_from_short_to_long() {
        let mut state = TraderState::default();
        state.apply_delta("F", -1000.0);
        let engine = test_engine(state);
        engine.process_alert(&alert(2, "F", Direction::BidHeavy, 13.40)).await.unwrap();
        assert_eq!(engine.current_position("F").await, 1000.0);
    }

    #[tokio::test]
    async fn ask_heavy_while_already_short_is_a_noop() {
        let mut state = TraderState::default();
        state.apply_delta("F", -1000.0);
        let engine = test_engine(state);
        engine.process_alert(&alert(3, "F", Direction::AskHeavy, 13.35)).await.unwrap();
        assert_eq!(engine.current_position("F").await, -1000.0);
    }

    #[tokio::test]
    async fn last_alert_id_advances_even_when_skipped() {
        let mut state = TraderState::default();
        state.apply_delta("F", -1000.0);
        let engine = test_engine(state);
        engine.process_alert(&alert(7, "F", Direction::AskHeavy, 13.35)).await.unwrap();
        assert_eq!(engine.last_alert_id().await, 7);
    }
}
