// =============================================================================
// Schwab Order Executor — bearer-token REST client for the brokerage's
// trader API
// =============================================================================
//
// Generalizes `binance/client.rs`'s signed-request idiom to the brokerage's
// bearer-token scheme: OAuth acquisition and refresh are handled by an
// external credential provider (see the design notes); this client only
// reads whatever token is on disk at `token_path` and attaches it as
// `Authorization: Bearer <token>` on every call, the way the reference
// engine's `SchwabOrderExecutor` wraps `schwab-py`'s already-authenticated
// client.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use super::{OrderExecutor, OrderResult, OrderStatusReport, Quote};
use crate::types::{OrderStatus, Side};

const BASE_URL: &str = "https://api.schwabapi.com/trader/v1";
const MARKET_DATA_URL: &str = "https://api.schwabapi.com/marketdata/v1";

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
}

fn load_bearer_token(token_path: &PathBuf) -> Result<String> {
    let raw = std::fs::read_to_string(token_path)
        .with_context(|| format!("failed to read Schwab token file at {}", token_path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&raw).context("malformed Schwab token file")?;
    Ok(parsed.access_token)
}

/// Bearer-token-authenticated client against the brokerage's trader API.
pub struct SchwabExecutor {
    account_id: i64,
    token_path: PathBuf,
    client: reqwest::Client,
    open_order_ids: RwLock<Vec<String>>,
}

impl SchwabExecutor {
    pub fn new(account_id: i64, token_path: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            account_id,
            token_path: token_path.into(),
            client,
            open_order_ids: RwLock::new(Vec::new()),
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let token = load_bearer_token(&self.token_path)?;
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("access token contains invalid header characters")?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn instruction_for(side: Side) -> &'static str {
        match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
            Side::Short => "SELL_SHORT",
            Side::Cover => "BUY_TO_COVER",
        }
    }

    async fn place_order(&self, body: serde_json::Value) -> Result<OrderResult> {
        let headers = self.auth_headers()?;
        let url = format!("{}/accounts/{}/orders", BASE_URL, self.account_id);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .context("order submission request failed")?;

        let status = resp.status();
        let location = resp
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(%status, raw, "order rejected by brokerage");
            return Ok(OrderResult {
                order_id: String::new(),
                status: OrderStatus::Rejected,
                filled_quantity: 0.0,
                avg_fill_price: 0.0,
                raw,
            });
        }

        let order_id = location
            .as_deref()
            .and_then(|loc| loc.rsplit('/').next())
            .unwrap_or_default()
            .to_string();

        if !order_id.is_empty() {
            self.open_order_ids.write().push(order_id.clone());
        }

        debug!(order_id, "order accepted by brokerage");
        Ok(OrderResult {
            order_id,
            status: OrderStatus::Pending,
            filled_quantity: 0.0,
            avg_fill_price: 0.0,
            raw,
        })
    }
}

#[async_trait::async_trait]
impl OrderExecutor for SchwabExecutor {
    #[instrument(skip(self), name = "schwab::submit_market", fields(symbol, side = %side, qty))]
    async fn submit_market(&self, symbol: &str, side: Side, qty: f64) -> Result<OrderResult> {
        let body = json!({
            "orderType": "MARKET",
            "session": "NORMAL",
            "duration": "DAY",
            "orderStrategyType": "SINGLE",
            "orderLegCollection": [{
                "instruction": Self::instruction_for(side),
                "quantity": qty,
                "instrument": { "symbol": symbol, "assetType": "EQUITY" },
            }],
        });
        self.place_order(body).await
    }

    #[instrument(skip(self), name = "schwab::submit_limit", fields(symbol, side = %side, qty, limit_price))]
    async fn submit_limit(&self, symbol: &str, side: Side, qty: f64, limit_price: f64) -> Result<OrderResult> {
        let body = json!({
            "orderType": "LIMIT",
            "session": "NORMAL",
            "duration": "DAY",
            "price": format!("{limit_price:.2}"),
            "orderStrategyType": "SINGLE",
            "orderLegCollection": [{
                "instruction": Self::instruction_for(side),
                "quantity": qty,
                "instrument": { "symbol": symbol, "assetType": "EQUITY" },
            }],
        });
        self.place_order(body).await
    }

    #[instrument(skip(self), name = "schwab::fetch_order_status", fields(order_id))]
    async fn fetch_order_status(&self, order_id: &str) -> Result<OrderStatusReport> {
        let headers = self.auth_headers()?;
        let url = format!("{}/accounts/{}/orders/{}", BASE_URL, self.account_id, order_id);
        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .context("order status request failed")?;
        let status_code = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order status response")?;
        if !status_code.is_success() {
            anyhow::bail!("order status request returned {status_code}: {body}");
        }

        let schwab_status = body["status"].as_str().unwrap_or("UNKNOWN");
        let status = match schwab_status {
            "WORKING" | "PENDING_ACTIVATION" | "QUEUED" | "ACCEPTED" => OrderStatus::Pending,
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" | "PENDING_CANCEL" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Pending,
        };
        let filled_quantity = body["filledQuantity"].as_f64().unwrap_or(0.0);
        let avg_fill_price = body["orderActivityCollection"]
            .get(0)
            .and_then(|a| a["executionLegs"].get(0))
            .and_then(|l| l["price"].as_f64())
            .unwrap_or(0.0);

        Ok(OrderStatusReport { status, filled_quantity, avg_fill_price, raw: body.to_string() })
    }

    #[instrument(skip(self), name = "schwab::cancel_order", fields(order_id))]
    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let headers = self.auth_headers()?;
        let url = format!("{}/accounts/{}/orders/{}", BASE_URL, self.account_id, order_id);
        let resp = self
            .client
            .delete(&url)
            .headers(headers)
            .send()
            .await
            .context("cancel order request failed")?;
        let ok = resp.status().is_success();
        self.open_order_ids.write().retain(|id| id != order_id);
        Ok(ok)
    }

    #[instrument(skip(self), name = "schwab::cancel_all_orders")]
    async fn cancel_all_orders(&self) -> Result<bool> {
        let ids: Vec<String> = self.open_order_ids.read().clone();
        let mut all_ok = true;
        for id in ids {
            match self.cancel_order(&id).await {
                Ok(ok) => all_ok &= ok,
                Err(err) => {
                    warn!(order_id = id, error = %err, "failed to cancel order during cancel_all");
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    #[instrument(skip(self), name = "schwab::fetch_quote", fields(symbol))]
    async fn fetch_quote(&self, symbol: &str) -> Result<Option<Quote>> {
        let headers = self.auth_headers()?;
        let url = format!("{}/{}/quotes", MARKET_DATA_URL, symbol);
        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .context("quote request failed")?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body: serde_json::Value = resp.json().await.context("failed to parse quote response")?;
        let quote_obj = &body[symbol]["quote"];
        Ok(Some(Quote {
            bid: quote_obj["bidPrice"].as_f64(),
            ask: quote_obj["askPrice"].as_f64(),
            last: quote_obj["lastPrice"].as_f64(),
        }))
    }
}

/// Convenience constructor matching §6's config surface, kept separate from
/// `new` so `main.rs` can build one from `EngineConfig` directly.
pub fn from_config(account_id: i64, token_path: &str) -> Result<Arc<dyn OrderExecutor>> {
    Ok(Arc::new(SchwabExecutor::new(account_id, token_path)?))
}
