// =============================================================================
// Order Executor — capability interface shared by the real and simulated
// implementations
// =============================================================================

pub mod controller;
pub mod schwab;
pub mod simulated;

use crate::types::{OrderStatus, Side};

/// Result of submitting an order: whatever the executor can report
/// immediately (simulated and REPRICE paths may know the fill synchronously;
/// real limit orders start PENDING and are polled separately).
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub raw: String,
}

/// Point-in-time status read, used by the fill-polling loop.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub raw: String,
}

/// A best-effort quote, used for limit price derivation and as the
/// midpoint/last fallback when no L1 price has arrived yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
}

/// Both the real brokerage-backed executor and the simulator implement this
/// so the decision engine and risk guard stay executor-agnostic.
#[async_trait::async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn submit_market(&self, symbol: &str, side: Side, qty: f64) -> anyhow::Result<OrderResult>;

    async fn submit_limit(&self, symbol: &str, side: Side, qty: f64, limit_price: f64) -> anyhow::Result<OrderResult>;

    async fn fetch_order_status(&self, order_id: &str) -> anyhow::Result<OrderStatusReport>;

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<bool>;

    async fn cancel_all_orders(&self) -> anyhow::Result<bool>;

    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Option<Quote>>;
}

/// Resolve the reference price for a limit order per the component design:
/// side-appropriate quote field, falling back through midpoint, last, and
/// finally the alert price that triggered the decision.
pub fn reference_price(quote: Option<&Quote>, side: Side, alert_price: f64) -> f64 {
    if let Some(q) = quote {
        let side_price = if side.uses_ask_reference() { q.ask } else { q.bid };
        if let Some(p) = side_price {
            return p;
        }
        if let (Some(b), Some(a)) = (q.bid, q.ask) {
            return (b + a) / 2.0;
        }
        if let Some(last) = q.last {
            return last;
        }
    }
    alert_price
}

/// Pad a reference price by `slippage_bps` in the direction that favors
/// getting filled, rounded to 4 decimals and floored at a penny.
pub fn pad_limit_price(reference_price: f64, side: Side, slippage_bps: f64) -> f64 {
    let factor = slippage_bps / 10_000.0;
    let padded = if side.uses_ask_reference() {
        reference_price * (1.0 + factor)
    } else {
        reference_price * (1.0 - factor)
    };
    (padded.max(0.01) * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    #[test]
    fn reference_price_prefers_side_appropriate_quote_field() {
        let quote = Quote { bid: Some(9.99), ask: Some(10.01), last: Some(10.00) };
        assert_eq!(reference_price(Some(&quote), Side::Buy, 5.0), 10.01);
        assert_eq!(reference_price(Some(&quote), Side::Sell, 5.0), 9.99);
    }

    #[test]
    fn reference_price_falls_back_through_midpoint_last_alert() {
        let quote = Quote { bid: None, ask: None, last: Some(10.0) };
        assert_eq!(reference_price(Some(&quote), Side::Buy, 5.0), 10.0);
        assert_eq!(reference_price(None, Side::Buy, 5.0), 5.0);
    }

    #[test]
    fn pad_limit_price_moves_toward_fill_and_clamps_at_a_penny() {
        let buy_price = pad_limit_price(10.00, Side::Buy, 10.0);
        assert!((buy_price - 10.01).abs() < 1e-4);
        let sell_price = pad_limit_price(10.00, Side::Sell, 10.0);
        assert!((sell_price - 9.99).abs() < 1e-4);
        assert_eq!(pad_limit_price(0.001, Side::Sell, 10.0), 0.01);
    }
}
