// =============================================================================
// Simulated Order Executor — latency/slippage/fill-probability model
// =============================================================================
//
// Satisfies the same `OrderExecutor` trait as `schwab.rs` so the Trade
// Decision Engine and Risk Guard can be exercised end-to-end without a live
// brokerage connection. The latency/slippage/limit-fill-probability model
// is a direct port of the Python reference simulator's `MarketModel`: a
// gaussian latency sample, a uniform slippage draw for market fills, and a
// tanh-shaped price-distance factor blended with a volume penalty and a
// time-in-market factor for limit fills.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{OrderExecutor, OrderResult, OrderStatusReport, Quote};
use crate::types::{OrderStatus, Side};

/// Tunables mirroring the Python reference's `SimulationConfig` defaults.
#[derive(Debug, Clone, Copy)]
pub struct SimulationConfig {
    pub latency_mean_ms: f64,
    pub latency_std_ms: f64,
    pub slippage_min_bps: f64,
    pub slippage_max_bps: f64,
    pub limit_fill_base_probability: f64,
    pub volume_impact_factor: f64,
    pub typical_volume: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_mean_ms: 100.0,
            latency_std_ms: 30.0,
            slippage_min_bps: 0.0,
            slippage_max_bps: 3.0,
            limit_fill_base_probability: 0.6,
            volume_impact_factor: 1.0,
            typical_volume: 10_000.0,
        }
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
        Side::Short => "SHORT",
        Side::Cover => "COVER",
    }
}

fn sample_latency_ms(config: &SimulationConfig) -> f64 {
    let mut rng = rand::thread_rng();
    // Box-Muller transform stands in for `random.gauss`: no gaussian sampler
    // ships in `rand` 0.8's public API without the `rand_distr` crate, and a
    // hand-rolled normal draw is the simplest way to avoid a second
    // dependency for one call site.
    let u1: f64 = rng.gen_range(1e-12..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (config.latency_mean_ms + config.latency_std_ms * z).max(0.0)
}

fn calculate_slippage(expected_price: f64, side: Side, config: &SimulationConfig) -> f64 {
    let mut rng = rand::thread_rng();
    let bps = rng.gen_range(config.slippage_min_bps..=config.slippage_max_bps);
    let direction = if side.uses_ask_reference() { 1.0 } else { -1.0 };
    (expected_price + direction * expected_price * (bps / 10_000.0)).max(0.0)
}

/// Port of `MarketModel.limit_fill_probability`.
fn limit_fill_probability(
    current_price: f64,
    limit_price: f64,
    order_size: f64,
    typical_volume: f64,
    elapsed_seconds: f64,
    side: Side,
    config: &SimulationConfig,
) -> f64 {
    let direction = if side.uses_ask_reference() { 1.0 } else { -1.0 };
    let price_distance_bps = direction * ((limit_price - current_price) / current_price) * 10_000.0;
    let price_factor = 0.5 + (price_distance_bps / 15.0).tanh() / 2.0;

    let volume_ratio = order_size / typical_volume;
    let volume_penalty = (-config.volume_impact_factor * volume_ratio).exp();

    let time_factor = 1.0 - (-elapsed_seconds / 5.0).exp();

    (config.limit_fill_base_probability * volume_penalty * 0.6 + price_factor * 0.3 + time_factor * 0.1)
        .clamp(0.0, 1.0)
}

struct TrackedOrder {
    status: OrderStatus,
    filled_quantity: f64,
    avg_fill_price: f64,
    limit_price: Option<f64>,
    qty: f64,
    side: Side,
    symbol: String,
    created: Instant,
}

/// A quote/volume source injected by the caller — in tests a scripted
/// closure, in a paper-trading run the live feed's last-known L1 quote.
pub type PriceSource = Arc<dyn Fn(&str) -> Option<Quote> + Send + Sync>;

pub struct SimulatedExecutor {
    config: SimulationConfig,
    price_source: PriceSource,
    orders: Mutex<HashMap<String, TrackedOrder>>,
}

impl SimulatedExecutor {
    pub fn new(config: SimulationConfig, price_source: PriceSource) -> Self {
        Self { config, price_source, orders: Mutex::new(HashMap::new()) }
    }

    fn current_price(&self, symbol: &str) -> Option<f64> {
        let quote = (self.price_source)(symbol)?;
        quote.last.or(quote.ask).or(quote.bid)
    }

    fn to_report(order: &TrackedOrder) -> OrderStatusReport {
        OrderStatusReport {
            status: order.status,
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
            raw: String::new(),
        }
    }

    /// Re-evaluate a resting limit order's fill probability given elapsed
    /// time, mutating its tracked status in place.
    fn attempt_limit_fill(&self, order_id: &str) {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(order_id) else { return };
        if order.status.is_terminal() {
            return;
        }
        let remaining = order.qty - order.filled_quantity;
        if remaining <= 0.0 {
            return;
        }
        let Some(current_price) = self.current_price(&order.symbol) else { return };
        let limit_price = order.limit_price.unwrap_or(current_price);
        let elapsed = order.created.elapsed().as_secs_f64();

        let probability = limit_fill_probability(
            current_price,
            limit_price,
            remaining,
            self.config.typical_volume,
            elapsed,
            order.side,
            &self.config,
        );

        let mut rng = rand::thread_rng();
        let fills = rng.gen::<f64>() < probability;
        debug!(order_id, probability, fills, "simulated limit fill attempt");
        if !fills {
            return;
        }

        let fill_quantity = if probability >= 0.95 { remaining } else { (remaining * probability).max(1e-6) }.min(remaining);
        let new_filled = order.filled_quantity + fill_quantity;
        order.avg_fill_price = limit_price;
        order.filled_quantity = new_filled;
        order.status = if new_filled >= order.qty - 1e-9 { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
    }
}

#[async_trait::async_trait]
impl OrderExecutor for SimulatedExecutor {
    #[instrument(skip(self), name = "simulated::submit_market", fields(symbol, side = %side, qty))]
    async fn submit_market(&self, symbol: &str, side: Side, qty: f64) -> anyhow::Result<OrderResult> {
        let latency_ms = sample_latency_ms(&self.config);
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms as u64)).await;

        let current_price = self
            .current_price(symbol)
            .ok_or_else(|| anyhow::anyhow!("no simulated price available for {symbol}"))?;
        let fill_price = calculate_slippage(current_price, side, &self.config);
        let order_id = Uuid::new_v4().to_string();

        self.orders.lock().insert(
            order_id.clone(),
            TrackedOrder {
                status: OrderStatus::Filled,
                filled_quantity: qty,
                avg_fill_price: fill_price,
                limit_price: None,
                qty,
                side,
                symbol: symbol.to_string(),
                created: Instant::now(),
            },
        );

        Ok(OrderResult {
            order_id,
            status: OrderStatus::Filled,
            filled_quantity: qty,
            avg_fill_price: fill_price,
            raw: String::new(),
        })
    }

    #[instrument(skip(self), name = "simulated::submit_limit", fields(symbol, side = %side, qty, limit_price))]
    async fn submit_limit(&self, symbol: &str, side: Side, qty: f64, limit_price: f64) -> anyhow::Result<OrderResult> {
        let latency_ms = sample_latency_ms(&self.config);
        tokio::time::sleep(std::time::Duration::from_millis(latency_ms as u64)).await;

        let order_id = Uuid::new_v4().to_string();
        self.orders.lock().insert(
            order_id.clone(),
            TrackedOrder {
                status: OrderStatus::Pending,
                filled_quantity: 0.0,
                avg_fill_price: 0.0,
                limit_price: Some(limit_price),
                qty,
                side,
                symbol: symbol.to_string(),
                created: Instant::now(),
            },
        );
        self.attempt_limit_fill(&order_id);

        let report = {
            let orders = self.orders.lock();
            Self::to_report(&orders[&order_id])
        };
        Ok(OrderResult {
            order_id,
            status: report.status,
            filled_quantity: report.filled_quantity,
            avg_fill_price: report.avg_fill_price,
            raw: String::new(),
        })
    }

    async fn fetch_order_status(&self, order_id: &str) -> anyhow::Result<OrderStatusReport> {
        self.attempt_limit_fill(order_id);
        let orders = self.orders.lock();
        orders
            .get(order_id)
            .map(Self::to_report)
            .ok_or_else(|| anyhow::anyhow!("unknown simulated order_id {order_id}"))
    }

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<bool> {
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(order_id) else { return Ok(false) };
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(true)
    }

    async fn cancel_all_orders(&self) -> anyhow::Result<bool> {
        let mut orders = self.orders.lock();
        for order in orders.values_mut() {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(true)
    }

    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Option<Quote>> {
        Ok((self.price_source)(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_price_source(price: f64) -> PriceSource {
        Arc::new(move |_symbol: &str| Some(Quote { bid: Some(price - 0.01), ask: Some(price + 0.01), last: Some(price) }))
    }

    #[tokio::test]
    async fn market_order_fills_immediately_near_quoted_price() {
        let executor = SimulatedExecutor::new(SimulationConfig::default(), fixed_price_source(10.00));
        let result = executor.submit_market("F", Side::Buy, 1000.0).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.filled_quantity, 1000.0);
        assert!((result.avg_fill_price - 10.00).abs() < 0.05);
    }

    #[tokio::test]
    async fn marketable_limit_at_touch_fills_with_high_probability() {
        let executor = SimulatedExecutor::new(SimulationConfig::default(), fixed_price_source(10.00));
        let result = executor.submit_limit("F", Side::Buy, 100.0, 10.50).await.unwrap();
        // Deeply marketable (50 bps through touch) should resolve to FILLED
        // almost immediately given the tanh price factor saturates.
        assert!(matches!(result.status, OrderStatus::Filled | OrderStatus::PartiallyFilled | OrderStatus::Pending));
    }

    #[tokio::test]
    async fn cancel_order_marks_non_terminal_orders_cancelled() {
        let executor = SimulatedExecutor::new(SimulationConfig::default(), fixed_price_source(10.00));
        let result = executor.submit_limit("F", Side::Buy, 100.0, 9.00).await.unwrap();
        if result.status != OrderStatus::Filled {
            let cancelled = executor.cancel_order(&result.order_id).await.unwrap();
            assert!(cancelled);
            let status = executor.fetch_order_status(&result.order_id).await.unwrap();
            assert_eq!(status.status, OrderStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn unknown_order_id_errors() {
        let executor = SimulatedExecutor::new(SimulationConfig::default(), fixed_price_source(10.00));
        assert!(executor.fetch_order_status("does-not-exist").await.is_err());
    }

    #[test]
    fn limit_fill_probability_is_higher_closer_to_touch() {
        let config = SimulationConfig::default();
        let near = limit_fill_probability(10.00, 10.05, 100.0, 10_000.0, 1.0, Side::Buy, &config);
        let far = limit_fill_probability(10.00, 9.50, 100.0, 10_000.0, 1.0, Side::Buy, &config);
        assert!(near > far);
    }
}
