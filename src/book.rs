// =============================================================================
// Book Normalizer — turns a raw L2 payload into validated per-venue rows
// =============================================================================
//
// The feed sends levels keyed either by short numeric codes or by readable
// names depending on subscription mode, so every lookup tries the numeric
// key first and falls back to the named one. Normalization never fails the
// whole payload: invalid levels/orders are dropped individually, with a
// single aggregated warning per side per payload (matching the reference
// engine's one-shot `error_reported` flags).
// =============================================================================

use serde_json::Value;
use tracing::warn;

use crate::types::VenueCode;

/// One validated row in a normalized order book: a venue quoting a positive
/// size at a positive price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookRow {
    pub venue: VenueCode,
    pub price: f64,
    pub size: u64,
}

/// A normalized book: validated bid and ask rows for one symbol.
#[derive(Debug, Clone, Default)]
pub struct Book {
    pub bids: Vec<BookRow>,
    pub asks: Vec<BookRow>,
}

/// Observability summary produced alongside normalization.
#[derive(Debug, Clone, Copy)]
pub struct BookSummary {
    pub top_bid: f64,
    pub top_ask: f64,
    pub total_bid_volume: u64,
    pub total_ask_volume: u64,
    pub spread_cents: f64,
}

impl Book {
    pub fn summarize(&self) -> BookSummary {
        let top_bid = self.bids.iter().map(|r| r.price).fold(0.0, f64::max);
        let top_ask = self
            .asks
            .iter()
            .map(|r| r.price)
            .fold(f64::INFINITY, f64::min);
        let top_ask = if top_ask.is_finite() { top_ask } else { 0.0 };
        let total_bid_volume: u64 = self.bids.iter().map(|r| r.size).sum();
        let total_ask_volume: u64 = self.asks.iter().map(|r| r.size).sum();
        let spread_cents = if top_bid > 0.0 && top_ask > 0.0 {
            (top_ask - top_bid) * 100.0
        } else {
            0.0
        };
        BookSummary {
            top_bid,
            top_ask,
            total_bid_volume,
            total_ask_volume,
            spread_cents,
        }
    }
}

/// Look up a value by a numeric key first, then a named fallback.
fn lookup<'a>(level: &'a Value, numeric_key: &str, named_key: &str) -> Option<&'a Value> {
    level.get(numeric_key).or_else(|| level.get(named_key))
}

fn as_price(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn as_count(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => s.parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

/// Parse one side (`"BIDS"`/`"2"` or `"ASKS"`/`"3"`) of a raw L2 payload into
/// validated `BookRow`s, dropping individual bad levels/orders.
fn parse_side(payload: &Value, numeric_key: &str, named_key: &str, is_bid: bool, symbol: &str) -> Vec<BookRow> {
    let mut out = Vec::new();
    let side_name = if is_bid { "bid" } else { "ask" };

    let levels = match lookup(payload, numeric_key, named_key) {
        Some(Value::Array(arr)) => arr,
        Some(_) => {
            warn!(symbol, side = side_name, "non-list levels in payload, skipping side");
            return out;
        }
        None => return out,
    };

    let mut missing_price_warned = false;
    let mut invalid_price_warned = false;

    for level in levels {
        if !level.is_object() {
            warn!(symbol, side = side_name, "invalid level entry, skipping");
            continue;
        }

        let price_key = if is_bid { "BID_PRICE" } else { "ASK_PRICE" };
        let price_raw = match lookup(level, "0", price_key) {
            Some(v) => v,
            None => {
                if !missing_price_warned {
                    warn!(symbol, side = side_name, "missing price in level, dropping");
                    missing_price_warned = true;
                }
                continue;
            }
        };

        let price = match as_price(price_raw) {
            Some(p) if p.is_finite() && p > 0.0 => p,
            _ => {
                if !invalid_price_warned {
                    warn!(symbol, side = side_name, "invalid price in level, dropping");
                    invalid_price_warned = true;
                }
                continue;
            }
        };

        let orders_key = if is_bid { "BIDS" } else { "ASKS" };
        let orders = match lookup(level, "3", orders_key) {
            Some(Value::Array(arr)) => arr,
            _ => {
                warn!(symbol, side = side_name, price, "level has no per-venue orders, dropping");
                continue;
            }
        };

        for order in orders {
            if !order.is_object() {
                warn!(symbol, side = side_name, "invalid order entry, dropping");
                continue;
            }

            let venue_raw = lookup(order, "0", "EXCHANGE")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let venue = match VenueCode::normalize(venue_raw) {
                Some(v) => v,
                None => {
                    warn!(symbol, side = side_name, venue = venue_raw, "unrecognised venue code, dropping order");
                    continue;
                }
            };

            let size_key = if is_bid { "BID_VOLUME" } else { "ASK_VOLUME" };
            let size = match lookup(order, "1", size_key).and_then(as_count) {
                Some(s) if s > 0 => s as u64,
                _ => {
                    warn!(symbol, side = side_name, venue = %venue, "invalid size in order, dropping");
                    continue;
                }
            };

            out.push(BookRow { venue, price, size });
        }
    }

    out
}

/// Normalize one raw L2 payload for `symbol` into a validated `Book`.
///
/// Never fails the whole payload: individual invalid levels/orders are
/// dropped and whatever remains is returned.
pub fn normalize(payload: &Value, symbol: &str) -> Book {
    let bids = parse_side(payload, "2", "BIDS", true, symbol);
    let asks = parse_side(payload, "3", "ASKS", false, symbol);
    Book { bids, asks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_named_payload() {
        let payload = json!({
            "BIDS": [
                { "BID_PRICE": 10.00, "BIDS": [ { "EXCHANGE": "NYSE", "BID_VOLUME": 500 } ] }
            ],
            "ASKS": [
                { "ASK_PRICE": 10.02, "ASKS": [ { "EXCHANGE": "NSDQ", "ASK_VOLUME": 300 } ] }
            ]
        });
        let book = normalize(&payload, "F");
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.bids[0].venue, VenueCode::Nyse);
        assert_eq!(book.asks[0].venue, VenueCode::Nasdaq);
        assert_eq!(book.bids[0].size, 500);
    }

    #[test]
    fn normalizes_numeric_keyed_payload() {
        let payload = json!({
            "2": [ { "0": "13.35", "3": [ { "0": "ARCX", "1": 200 } ] } ],
            "3": [ { "0": 13.40, "3": [ { "0": "EDGX", "1": 150 } ] } ]
        });
        let book = normalize(&payload, "F");
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].venue, VenueCode::NyseArca);
        assert_eq!(book.bids[0].price, 13.35);
        assert_eq!(book.asks[0].venue, VenueCode::CboeEdgx);
    }

    #[test]
    fn drops_invalid_rows_without_failing_payload() {
        let payload = json!({
            "BIDS": [
                { "BID_PRICE": -1.0, "BIDS": [ { "EXCHANGE": "NYSE", "BID_VOLUME": 100 } ] },
                { "BID_PRICE": 10.0, "BIDS": [ { "EXCHANGE": "UNKNOWN_VENUE", "BID_VOLUME": 100 } ] },
                { "BID_PRICE": 10.0, "BIDS": [ { "EXCHANGE": "NYSE", "BID_VOLUME": -5 } ] },
                { "BID_PRICE": 10.0, "BIDS": [ { "EXCHANGE": "NYSE", "BID_VOLUME": 200 } ] }
            ],
            "ASKS": []
        });
        let book = normalize(&payload, "F");
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].size, 200);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn summary_computes_spread() {
        let book = Book {
            bids: vec![BookRow { venue: VenueCode::Nyse, price: 10.00, size: 100 }],
            asks: vec![BookRow { venue: VenueCode::Nasdaq, price: 10.05, size: 50 }],
        };
        let summary = book.summarize();
        assert_eq!(summary.top_bid, 10.00);
        assert_eq!(summary.top_ask, 10.05);
        assert!((summary.spread_cents - 5.0).abs() < 1e-9);
    }

    #[test]
    fn empty_book_summary_has_zero_spread() {
        let book = Book::default();
        let summary = book.summarize();
        assert_eq!(summary.spread_cents, 0.0);
        assert_eq!(summary.top_bid, 0.0);
        assert_eq!(summary.top_ask, 0.0);
    }
}
