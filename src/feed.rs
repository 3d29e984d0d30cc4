// =============================================================================
// Streaming feed ingestion
// =============================================================================
//
// Generalizes `market_data/orderbook.rs`'s `run_depth_stream` idiom — connect,
// split the stream, loop on `read.next()` with the `Some(Ok)/Some(Err)/None`
// three-way match — to this system's wider message diet (L1 quotes, chart
// bars, trade prints, L2 books) and its 30s-silence reconnect policy. The
// wire shape itself is opaque per the component design: only this module
// parses it, everything past `Engine::handle_book`/`update_l1`/etc. works in
// typed terms.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::executor::Quote;
use crate::imbalance::L1Quote;

/// Last-seen quote per symbol, shared with the simulated executor's price
/// source in dry-run mode so fills are priced off real feed data without
/// the executor depending on the detector's private state.
#[derive(Default)]
pub struct QuoteCache(RwLock<HashMap<String, Quote>>);

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, symbol: &str, quote: &L1Quote) {
        let resolved = Quote {
            bid: quote.bid_price,
            ask: quote.ask_price,
            last: quote.last_price.or(quote.close_price),
        };
        self.0.write().insert(symbol.to_string(), resolved);
    }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.0.read().get(symbol).copied()
    }
}

/// One parsed feed envelope. The real wire format keys these by message
/// type; anything unrecognised is logged and dropped rather than failing
/// the whole connection (mirrors `book.rs`'s never-fail-the-payload stance).
enum FeedMessage<'a> {
    Book { symbol: String, payload: &'a Value },
    Quote { symbol: String, quote: L1Quote },
    Trade { symbol: String, price: f64, size: u64 },
    ChartBar { symbol: String, price: f64, cum_volume: i64 },
}

fn parse_message(raw: &Value) -> Option<FeedMessage<'_>> {
    let kind = raw.get("type")?.as_str()?;
    let symbol = raw.get("symbol")?.as_str()?.to_string();
    match kind {
        "book" => Some(FeedMessage::Book { symbol, payload: raw.get("payload")? }),
        "quote" => {
            let quote = L1Quote {
                last_price: raw.get("last").and_then(Value::as_f64),
                bid_price: raw.get("bid").and_then(Value::as_f64),
                ask_price: raw.get("ask").and_then(Value::as_f64),
                close_price: raw.get("close").and_then(Value::as_f64),
            };
            Some(FeedMessage::Quote { symbol, quote })
        }
        "trade" => {
            let price = raw.get("price")?.as_f64()?;
            let size = raw.get("size")?.as_u64()?;
            Some(FeedMessage::Trade { symbol, price, size })
        }
        "chart_bar" => {
            let price = raw.get("price")?.as_f64()?;
            let cum_volume = raw.get("cum_volume")?.as_i64()?;
            Some(FeedMessage::ChartBar { symbol, price, cum_volume })
        }
        other => {
            debug!(kind = other, "ignoring unrecognised feed message type");
            None
        }
    }
}

fn now_wall_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Connect with bounded retries (`feed_connect_retries` attempts, sleeping
/// `feed_connect_backoff` between them) per the Supervisor's startup
/// sequence. Returns the established stream, or the last connect error once
/// retries are exhausted.
#[instrument(skip(url), fields(url = %url))]
async fn connect_with_retries(
    url: &str,
    retries: u32,
    backoff: Duration,
) -> anyhow::Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect_async(url).await {
            Ok((stream, _response)) => {
                info!(attempt, "feed connected");
                return Ok(stream);
            }
            Err(err) if attempt < retries => {
                warn!(attempt, error = %err, "feed connect attempt failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                error!(attempt, error = %err, "feed connect exhausted retries");
                return Err(err).map_err(anyhow::Error::from);
            }
        }
    }
}

/// Run one connect-subscribe-consume cycle for the configured symbol set.
/// Returns on any terminal condition (clean close, read error, or 30s
/// silence) so the caller's supervisor loop decides whether to reconnect.
pub async fn run_feed(
    engine: &Arc<Engine>,
    quotes: Option<&Arc<QuoteCache>>,
    url: &str,
    symbols: &[String],
    connect_retries: u32,
    connect_backoff: Duration,
    silence_timeout: Duration,
) -> anyhow::Result<()> {
    let stream = connect_with_retries(url, connect_retries, connect_backoff).await?;
    let (mut write, mut read) = stream.split();

    let subscribe = serde_json::json!({
        "action": "subscribe",
        "symbols": symbols,
        "fields": ["book", "quote", "trade", "chart_bar"],
    });
    {
        use futures_util::SinkExt;
        write.send(Message::Text(subscribe.to_string())).await?;
    }
    info!(symbols = ?symbols, "subscribed to feed");

    loop {
        let next = timeout(silence_timeout, read.next()).await;
        match next {
            Ok(Some(Ok(Message::Text(text)))) => {
                handle_text(engine, quotes, &text);
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(Message::Close(frame)))) => {
                warn!(?frame, "feed closed connection");
                return Ok(());
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => {
                error!(error = %err, "feed read error");
                return Err(err.into());
            }
            Ok(None) => {
                warn!("feed stream ended");
                return Ok(());
            }
            Err(_) => {
                let err = EngineError::FeedTimeout { idle_secs: silence_timeout.as_secs() };
                warn!(error = %err, event = err.event_name(), "feed silent, reconnecting");
                return Err(err.into());
            }
        }
    }
}

fn handle_text(engine: &Arc<Engine>, quotes: Option<&Arc<QuoteCache>>, text: &str) {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            let wrapped = EngineError::ParseError(err.to_string());
            warn!(error = %wrapped, event = wrapped.event_name(), "failed to parse feed message");
            return;
        }
    };

    let Some(message) = parse_message(&raw) else { return };
    let now_instant = Instant::now();
    let now_wall = now_wall_seconds();

    match message {
        FeedMessage::Book { symbol, payload } => {
            engine.handle_book(&symbol, payload, now_instant, now_wall);
        }
        FeedMessage::Quote { symbol, quote } => {
            if let Some(cache) = quotes {
                cache.update(&symbol, &quote);
            }
            engine.update_l1(&symbol, quote);
        }
        FeedMessage::Trade { symbol, price, size } => {
            engine.feed_trade(&symbol, now_instant, price, size);
        }
        FeedMessage::ChartBar { symbol, price, cum_volume } => {
            engine.feed_chart_bar(&symbol, now_instant, price, cum_volume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_quote_message() {
        let raw = json!({ "type": "quote", "symbol": "F", "bid": 13.39, "ask": 13.41, "last": 13.40 });
        match parse_message(&raw) {
            Some(FeedMessage::Quote { symbol, quote }) => {
                assert_eq!(symbol, "F");
                assert_eq!(quote.bid_price, Some(13.39));
                assert_eq!(quote.ask_price, Some(13.41));
            }
            _ => panic!("expected quote message"),
        }
    }

    #[test]
    fn parses_trade_message() {
        let raw = json!({ "type": "trade", "symbol": "F", "price": 13.40, "size": 500 });
        match parse_message(&raw) {
            Some(FeedMessage::Trade { symbol, price, size }) => {
                assert_eq!(symbol, "F");
                assert_eq!(price, 13.40);
                assert_eq!(size, 500);
            }
            _ => panic!("expected trade message"),
        }
    }

    #[test]
    fn unrecognised_message_type_is_dropped() {
        let raw = json!({ "type": "heartbeat" });
        assert!(parse_message(&raw).is_none());
    }

    #[test]
    fn missing_symbol_is_dropped() {
        let raw = json!({ "type": "trade", "price": 1.0, "size": 1 });
        assert!(parse_message(&raw).is_none());
    }
}
