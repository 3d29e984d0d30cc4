// =============================================================================
// Execution Controller — per-leg order orchestration atop the raw
// OrderExecutor capability interface
// =============================================================================
//
// The reference engine's `ExecutionEngine` wraps a bare Binance client with
// the policy layer (position sizing, risk checks) that the client itself
// doesn't know about. This module plays the same role for the brokerage
// interface: `OrderExecutor` only exposes primitive submit/poll/cancel calls,
// so limit-first pricing, fill polling, timeout-policy branching, and the
// bad-fill guard all live here instead of being duplicated at every call
// site that wants to move a leg to a terminal state.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use super::{pad_limit_price, reference_price, OrderExecutor};
use crate::error::EngineError;
use crate::types::{OrderStatus, Side, TimeoutPolicy};

/// Knobs the controller needs from `EngineConfig`, gathered into one struct
/// so call sites don't have to thread six scalar config fields individually.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionParams {
    pub prefer_limit_orders: bool,
    pub limit_slippage_bps: f64,
    pub limit_fill_timeout: Duration,
    pub limit_fill_poll_interval: Duration,
    pub timeout_policy: TimeoutPolicy,
}

/// Outcome of driving one leg (a single side/qty submission) to a terminal
/// state. `filled_quantity` may be less than the requested qty under
/// ABANDON; `avg_fill_price` is the last price the executor reported.
#[derive(Debug, Clone)]
pub struct LegOutcome {
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
}

impl LegOutcome {
    pub fn filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }
}

/// Drive one order leg to a terminal state, applying limit-first pricing,
/// fill polling, the configured timeout policy, and the bad-fill guard.
///
/// Returns `Ok(LegOutcome)` for any terminal outcome including rejects and
/// abandons (callers branch on `.filled()` per §4.6's flip-only rules).
/// Returns `Err(EngineError::BadFill)` when a confirmed fill lands in one of
/// the suspicious whole-cent bands — callers must treat this as fatal and
/// route it to the Risk Guard's emergency shutdown rather than continuing
/// the flip sequence.
#[instrument(skip(executor, params), name = "execute_leg", fields(symbol, side = %side, qty))]
pub async fn execute_leg(
    executor: &Arc<dyn OrderExecutor>,
    params: &ExecutionParams,
    symbol: &str,
    side: Side,
    qty: f64,
    alert_price: f64,
) -> Result<LegOutcome, EngineError> {
    if !params.prefer_limit_orders {
        return execute_market(executor, symbol, side, qty).await;
    }

    let quote = executor.fetch_quote(symbol).await.unwrap_or(None);
    let reference = reference_price(quote.as_ref(), side, alert_price);
    let limit_price = pad_limit_price(reference, side, params.limit_slippage_bps);

    let submit = executor
        .submit_limit(symbol, side, qty, limit_price)
        .await
        .map_err(|err| reject(symbol, side, qty, &err.to_string()))?;

    if submit.status == OrderStatus::Rejected || submit.order_id.is_empty() {
        return Err(reject(symbol, side, qty, "order rejected at submission"));
    }

    let polled = poll_until_terminal(executor, &submit.order_id, qty, params).await?;

    match polled.status {
        // The bad-fill guard is scoped to confirmed *market* fills (§4.7); a
        // legitimate limit fill can land on a whole-cent-adjacent price
        // without being a stub-quote execution, so it is not checked here.
        OrderStatus::Timeout => apply_timeout_policy(executor, params, symbol, side, qty, &submit.order_id, polled).await,
        _ => Ok(polled),
    }
}

async fn execute_market(
    executor: &Arc<dyn OrderExecutor>,
    symbol: &str,
    side: Side,
    qty: f64,
) -> Result<LegOutcome, EngineError> {
    let result = executor
        .submit_market(symbol, side, qty)
        .await
        .map_err(|err| reject(symbol, side, qty, &err.to_string()))?;
    if result.status == OrderStatus::Rejected {
        return Err(reject(symbol, side, qty, "market order rejected"));
    }
    let outcome = LegOutcome {
        status: OrderStatus::Filled,
        filled_quantity: result.filled_quantity.max(qty),
        avg_fill_price: result.avg_fill_price,
    };
    check_bad_fill(symbol, side, outcome.avg_fill_price, outcome)
}

/// Poll `fetch_order_status` every `limit_fill_poll_interval` until a
/// terminal status is observed or `limit_fill_timeout` elapses.
/// `filled_seen` is clamped non-decreasing to `qty` per §4.7's
/// `_apply_filled_delta` rule.
async fn poll_until_terminal(
    executor: &Arc<dyn OrderExecutor>,
    order_id: &str,
    qty: f64,
    params: &ExecutionParams,
) -> Result<LegOutcome, EngineError> {
    let started = Instant::now();
    let mut filled_seen = 0.0_f64;

    loop {
        let report = match executor.fetch_order_status(order_id).await {
            Ok(r) => r,
            Err(err) if started.elapsed() < params.limit_fill_timeout => {
                warn!(order_id, error = %err, "fetch_order_status failed, will retry");
                tokio::time::sleep(params.limit_fill_poll_interval).await;
                continue;
            }
            Err(err) => {
                warn!(order_id, error = %err, "fetch_order_status failed and timeout elapsed");
                return Err(EngineError::LimitTimeout { order_id: order_id.to_string(), elapsed_secs: started.elapsed().as_secs() });
            }
        };

        filled_seen = report.filled_quantity.max(filled_seen).min(qty);

        if report.status.is_terminal() {
            return Ok(LegOutcome {
                status: report.status,
                filled_quantity: filled_seen,
                avg_fill_price: report.avg_fill_price,
            });
        }

        if started.elapsed() >= params.limit_fill_timeout {
            info!(order_id, filled_seen, "limit order timed out waiting for fill");
            return Ok(LegOutcome { status: OrderStatus::Timeout, filled_quantity: filled_seen, avg_fill_price: report.avg_fill_price });
        }

        tokio::time::sleep(params.limit_fill_poll_interval).await;
    }
}

async fn apply_timeout_policy(
    executor: &Arc<dyn OrderExecutor>,
    params: &ExecutionParams,
    symbol: &str,
    side: Side,
    qty: f64,
    order_id: &str,
    timed_out: LegOutcome,
) -> Result<LegOutcome, EngineError> {
    let remaining = (qty - timed_out.filled_quantity).max(0.0);

    match params.timeout_policy {
        TimeoutPolicy::Abandon => {
            let _ = executor.cancel_order(order_id).await;
            info!(symbol, %side, filled = timed_out.filled_quantity, "abandoning remainder after limit timeout");
            Ok(timed_out)
        }
        TimeoutPolicy::Market => {
            let _ = executor.cancel_order(order_id).await;
            if remaining <= 0.0 {
                return Ok(LegOutcome { status: OrderStatus::Filled, ..timed_out });
            }
            let market = execute_market(executor, symbol, side, remaining).await?;
            Ok(LegOutcome {
                status: OrderStatus::Filled,
                filled_quantity: timed_out.filled_quantity + market.filled_quantity,
                avg_fill_price: market.avg_fill_price,
            })
        }
        TimeoutPolicy::Reprice => {
            let _ = executor.cancel_order(order_id).await;
            if remaining <= 0.0 {
                return Ok(LegOutcome { status: OrderStatus::Filled, ..timed_out });
            }
            let quote = executor.fetch_quote(symbol).await.unwrap_or(None);
            let reference = reference_price(quote.as_ref(), side, timed_out.avg_fill_price.max(0.01));
            let limit_price = pad_limit_price(reference, side, params.limit_slippage_bps);

            let resubmit = executor
                .submit_limit(symbol, side, remaining, limit_price)
                .await
                .map_err(|err| reject(symbol, side, remaining, &err.to_string()))?;
            if resubmit.status == OrderStatus::Rejected || resubmit.order_id.is_empty() {
                return Ok(timed_out);
            }
            let second_poll = poll_until_terminal(executor, &resubmit.order_id, remaining, params).await?;
            Ok(LegOutcome {
                status: second_poll.status,
                filled_quantity: timed_out.filled_quantity + second_poll.filled_quantity,
                avg_fill_price: second_poll.avg_fill_price,
            })
        }
    }
}

/// The bad-fill guard from §4.7: a confirmed fill landing at a suspicious
/// whole-cent extreme engages emergency shutdown rather than being treated
/// as a normal fill.
fn check_bad_fill(symbol: &str, side: Side, price: f64, outcome: LegOutcome) -> Result<LegOutcome, EngineError> {
    let cents_fraction = price.fract();
    let buy_band = (0.985..=0.995).contains(&cents_fraction) && side.uses_ask_reference();
    let sell_band = (0.005..=0.015).contains(&cents_fraction) && !side.uses_ask_reference();
    if buy_band || sell_band {
        return Err(EngineError::BadFill { symbol: symbol.to_string(), price });
    }
    Ok(outcome)
}

fn reject(symbol: &str, side: Side, qty: f64, reason: &str) -> EngineError {
    EngineError::ExecutorReject { symbol: symbol.to_string(), side: side.to_string(), qty, reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{OrderResult, OrderStatusReport, Quote};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// A scripted executor: submit_limit always returns PENDING, then
    /// fetch_order_status steps through a preset sequence of reports.
    struct ScriptedExecutor {
        reports: AsyncMutex<Vec<OrderStatusReport>>,
        submit_calls: AtomicUsize,
        market_price: f64,
    }

    impl ScriptedExecutor {
        fn new(reports: Vec<OrderStatusReport>, market_price: f64) -> Self {
            Self { reports: AsyncMutex::new(reports), submit_calls: AtomicUsize::new(0), market_price }
        }
    }

    #[async_trait::async_trait]
    impl OrderExecutor for ScriptedExecutor {
        async fn submit_market(&self, _symbol: &str, _side: Side, qty: f64) -> anyhow::Result<OrderResult> {
            Ok(OrderResult {
                order_id: "market-1".into(),
                status: OrderStatus::Filled,
                filled_quantity: qty,
                avg_fill_price: self.market_price,
                raw: String::new(),
            })
        }

        async fn submit_limit(&self, _symbol: &str, _side: Side, _qty: f64, _limit_price: f64) -> anyhow::Result<OrderResult> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(OrderResult { order_id: "limit-1".into(), status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() })
        }

        async fn fetch_order_status(&self, _order_id: &str) -> anyhow::Result<OrderStatusReport> {
            let mut reports = self.reports.lock().await;
            if reports.is_empty() {
                anyhow::bail!("no more scripted reports");
            }
            Ok(reports.remove(0))
        }

        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn cancel_all_orders(&self) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn fetch_quote(&self, _symbol: &str) -> anyhow::Result<Option<Quote>> {
            Ok(Some(Quote { bid: Some(10.00), ask: Some(10.02), last: Some(10.01) }))
        }
    }

    fn params(policy: TimeoutPolicy) -> ExecutionParams {
        ExecutionParams {
            prefer_limit_orders: true,
            limit_slippage_bps: 10.0,
            limit_fill_timeout: Duration::from_millis(30),
            limit_fill_poll_interval: Duration::from_millis(5),
            timeout_policy: policy,
        }
    }

    fn market_params(policy: TimeoutPolicy) -> ExecutionParams {
        ExecutionParams { prefer_limit_orders: false, ..params(policy) }
    }

    // S3 — limit timeout with MARKET policy fills the remainder via market.
    #[tokio::test]
    async fn s3_limit_timeout_market_policy_fills_remainder() {
        let reports = vec![
            OrderStatusReport { status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() },
            OrderStatusReport { status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() },
            OrderStatusReport { status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() },
            OrderStatusReport { status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() },
            OrderStatusReport { status: OrderStatus::Pending, filled_quantity: 0.0, avg_fill_price: 0.0, raw: String::new() },
        ];
        let executor: Arc<dyn OrderExecutor> = Arc::new(ScriptedExecutor::new(reports, 10.50));
        let outcome = execute_leg(&executor, &params(TimeoutPolicy::Market), "F", Side::Buy, 500.0, 10.00)
            .await
            .unwrap();
        assert_eq!(outcome.status, OrderStatus::Filled);
        assert_eq!(outcome.filled_quantity, 500.0);
    }

    // S5 — a market fill at a suspicious whole-cent extreme triggers BadFill.
    #[tokio::test]
    async fn s5_bad_fill_guard_trips_on_suspicious_cents() {
        let executor: Arc<dyn OrderExecutor> = Arc::new(ScriptedExecutor::new(vec![], 10.01));
        let err = execute_leg(&executor, &market_params(TimeoutPolicy::Market), "F", Side::Sell, 500.0, 10.00)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BadFill { .. }));
    }

    #[tokio::test]
    async fn normal_fill_price_does_not_trip_bad_fill_guard() {
        let executor: Arc<dyn OrderExecutor> = Arc::new(ScriptedExecutor::new(vec![], 10.37));
        let outcome = execute_leg(&executor, &market_params(TimeoutPolicy::Market), "F", Side::Sell, 500.0, 10.00)
            .await
            .unwrap();
        assert!(outcome.filled());
    }

    // A limit fill landing on a whole-cent-adjacent price is not a market
    // stub-quote execution and must not trip the bad-fill guard.
    #[tokio::test]
    async fn limit_fill_at_suspicious_cents_does_not_trip_bad_fill_guard() {
        let reports = vec![OrderStatusReport { status: OrderStatus::Filled, filled_quantity: 500.0, avg_fill_price: 10.01, raw: String::new() }];
        let executor: Arc<dyn OrderExecutor> = Arc::new(ScriptedExecutor::new(reports, 10.01));
        let outcome = execute_leg(&executor, &params(TimeoutPolicy::Market), "F", Side::Sell, 500.0, 10.00)
            .await
            .unwrap();
        assert!(outcome.filled());
        assert_eq!(outcome.avg_fill_price, 10.01);
    }

    #[tokio::test]
    async fn abandon_policy_leaves_partial_fill_applied() {
        let reports = vec![
            OrderStatusReport { status: OrderStatus::PartiallyFilled, filled_quantity: 200.0, avg_fill_price: 10.01, raw: String::new() },
            OrderStatusReport { status: OrderStatus::PartiallyFilled, filled_quantity: 200.0, avg_fill_price: 10.01, raw: String::new() },
            OrderStatusReport { status: OrderStatus::PartiallyFilled, filled_quantity: 200.0, avg_fill_price: 10.01, raw: String::new() },
            OrderStatusReport { status: OrderStatus::PartiallyFilled, filled_quantity: 200.0, avg_fill_price: 10.01, raw: String::new() },
            OrderStatusReport { status: OrderStatus::PartiallyFilled, filled_quantity: 200.0, avg_fill_price: 10.01, raw: String::new() },
        ];
        let executor: Arc<dyn OrderExecutor> = Arc::new(ScriptedExecutor::new(reports, 10.05));
        let outcome = execute_leg(&executor, &params(TimeoutPolicy::Abandon), "F", Side::Buy, 500.0, 10.00)
            .await
            .unwrap();
        assert_eq!(outcome.filled_quantity, 200.0);
        assert_eq!(outcome.status, OrderStatus::Timeout);
    }
}
