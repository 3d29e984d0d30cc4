// =============================================================================
// Imbalance Detector — per-symbol rolling state, venue counting, alert gating
// =============================================================================
//
// Owns the per-symbol state enumerated in the design notes: Rolling Windows
// (see `window.rs`), last-seen L1 quotes, last-alert timestamps, and bounded
// imbalance rings. This module only *decides* whether an alert should fire;
// assigning it a durable id and dispatching it are the Alert Log's and
// Dispatch Bus's jobs (see `alert_log.rs`, `dispatch.rs`).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::book::{self, Book};
use crate::types::{Direction, VenueCode};
use crate::window::RollingWindow;

/// Minimum gap between heavy-venue counts required for a direction candidate
/// to exist. Fixed by design, not configurable (see component design §4.3).
const HEAVY_VENUE_GAP: u32 = 4;

// =============================================================================
// Venue aggregation
// =============================================================================

#[derive(Debug, Clone, Default)]
struct VenueCell {
    bid_sum: u64,
    ask_sum: u64,
    bid_prices: Vec<f64>,
    ask_prices: Vec<f64>,
}

fn aggregate_venues(book: &Book) -> HashMap<VenueCode, VenueCell> {
    let mut cells: HashMap<VenueCode, VenueCell> = HashMap::new();
    for row in &book.bids {
        let cell = cells.entry(row.venue).or_default();
        cell.bid_sum += row.size;
        cell.bid_prices.push(row.price);
    }
    for row in &book.asks {
        let cell = cells.entry(row.venue).or_default();
        cell.ask_sum += row.size;
        cell.ask_prices.push(row.price);
    }
    cells
}

/// Aggregated metrics over all *valid* venues in one book tick.
#[derive(Debug, Clone)]
pub struct BookMetrics {
    pub total_bids: u64,
    pub total_asks: u64,
    pub ask_to_bid_ratio: f64,
    pub bid_to_ask_ratio: f64,
    pub ask_heavy_venues: u32,
    pub bid_heavy_venues: u32,
    pub valid_exchanges: u32,
    pub per_venue: HashMap<VenueCode, (u64, u64)>,
}

/// Compute `BookMetrics` from the raw per-venue aggregation, counting only
/// venues with both sides present and a per-venue spread within
/// `max_range_cents`.
fn compute_metrics(cells: &HashMap<VenueCode, VenueCell>, max_range_cents: u32) -> BookMetrics {
    let mut total_bids = 0u64;
    let mut total_asks = 0u64;
    let mut ask_heavy_venues = 0u32;
    let mut bid_heavy_venues = 0u32;
    let mut per_venue = HashMap::new();

    for (venue, cell) in cells {
        if cell.bid_prices.is_empty() || cell.ask_prices.is_empty() {
            continue;
        }
        let min_ask = cell.ask_prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_bid = cell.bid_prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let spread_cents = (min_ask - max_bid) * 100.0;
        if spread_cents > max_range_cents as f64 {
            continue;
        }

        total_bids += cell.bid_sum;
        total_asks += cell.ask_sum;
        per_venue.insert(*venue, (cell.bid_sum, cell.ask_sum));

        if cell.ask_sum > cell.bid_sum {
            ask_heavy_venues += 1;
        } else if cell.bid_sum > cell.ask_sum {
            bid_heavy_venues += 1;
        }
    }

    let ask_to_bid_ratio = if total_bids > 0 {
        total_asks as f64 / total_bids as f64
    } else {
        f64::INFINITY
    };
    let bid_to_ask_ratio = if total_asks > 0 {
        total_bids as f64 / total_asks as f64
    } else {
        f64::INFINITY
    };

    BookMetrics {
        total_bids,
        total_asks,
        ask_to_bid_ratio,
        bid_to_ask_ratio,
        ask_heavy_venues,
        bid_heavy_venues,
        valid_exchanges: per_venue.len() as u32,
        per_venue,
    }
}

/// Determine the candidate direction from heavy-venue counts. Ask-heavy wins
/// any (impossible) tie because it is checked first.
fn determine_direction(metrics: &BookMetrics, disable_bid_heavy: bool) -> Option<Direction> {
    if metrics.ask_heavy_venues >= metrics.bid_heavy_venues + HEAVY_VENUE_GAP {
        Some(Direction::AskHeavy)
    } else if !disable_bid_heavy && metrics.bid_heavy_venues >= metrics.ask_heavy_venues + HEAVY_VENUE_GAP {
        Some(Direction::BidHeavy)
    } else {
        None
    }
}

// =============================================================================
// Imbalance ring
// =============================================================================

const RING_CAP: usize = 200;

struct ImbalanceEvent {
    ts: Instant,
    direction: Direction,
}

/// Bounded per-symbol ring of recent direction candidates, used to measure
/// dwell time (how long a same-direction streak has persisted).
#[derive(Default)]
struct ImbalanceRing {
    events: VecDeque<ImbalanceEvent>,
}

impl ImbalanceRing {
    fn push(&mut self, ts: Instant, direction: Direction) {
        self.events.push_back(ImbalanceEvent { ts, direction });
        while self.events.len() > RING_CAP {
            self.events.pop_front();
        }
    }

    /// Scan from newest backwards while direction matches; return the dwell
    /// time of the uninterrupted streak ending at `now`.
    fn dwell_time(&self, now: Instant, direction: Direction) -> Duration {
        let mut first_matching_ts = None;
        for event in self.events.iter().rev() {
            if event.direction != direction {
                break;
            }
            first_matching_ts = Some(event.ts);
        }
        match first_matching_ts {
            Some(ts) => now.duration_since(ts),
            None => Duration::ZERO,
        }
    }
}

// =============================================================================
// L1 quote cache
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct L1Quote {
    pub last_price: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub close_price: Option<f64>,
}

impl L1Quote {
    /// Price resolution order for the alert: LAST_PRICE, then BID/ASK/CLOSE.
    fn resolved_price(&self) -> Option<f64> {
        self.last_price
            .or(self.bid_price)
            .or(self.ask_price)
            .or(self.close_price)
    }
}

// =============================================================================
// Detector
// =============================================================================

/// A candidate alert the detector has decided should fire. Carries
/// everything needed to build a durable `Alert` except the monotonic id,
/// which the Alert Log assigns at append time.
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub symbol: String,
    pub direction: Direction,
    pub ratio: f64,
    pub total_bids: u64,
    pub total_asks: u64,
    pub heavy_venues: u32,
    pub price: f64,
    pub exchanges: Vec<VenueCode>,
}

/// Tunable gating parameters, copied out of `EngineConfig` at construction.
pub struct DetectorParams {
    pub window_seconds: u64,
    pub min_ask_heavy: u32,
    pub min_bid_heavy: u32,
    pub max_range_cents: u32,
    pub alert_throttle_sec: u64,
    pub min_volume: f64,
    pub min_imbalance_duration_sec: u64,
    pub disable_bid_heavy: bool,
}

/// Owns all per-symbol detector state across the process lifetime.
pub struct Detector {
    params: DetectorParams,
    windows: HashMap<String, RollingWindow>,
    last_l1: HashMap<String, L1Quote>,
    last_alert: HashMap<String, Instant>,
    rings: HashMap<String, ImbalanceRing>,
}

impl Detector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            windows: HashMap::new(),
            last_l1: HashMap::new(),
            last_alert: HashMap::new(),
            rings: HashMap::new(),
        }
    }

    fn window_for(&mut self, symbol: &str) -> &mut RollingWindow {
        let window_seconds = self.params.window_seconds;
        self.windows
            .entry(symbol.to_string())
            .or_insert_with(|| RollingWindow::new(window_seconds))
    }

    /// Update the last-seen L1 quote for `symbol`. Returns `false` if no
    /// valid price field was present (the whole message is still otherwise
    /// processed upstream — this never fails the caller).
    pub fn update_l1(&mut self, symbol: &str, quote: L1Quote) -> bool {
        if quote.resolved_price().is_none() {
            return false;
        }
        self.last_l1.insert(symbol.to_string(), quote);
        true
    }

    /// The last-resolved price for `symbol` (LAST_PRICE, then BID/ASK/CLOSE),
    /// used by the simulated executor as its price source.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_l1.get(symbol).and_then(|q| q.resolved_price())
    }

    /// Feed a time-sale print directly into the rolling window.
    pub fn feed_trade(&mut self, symbol: &str, ts: Instant, price: f64, size: u64) {
        self.window_for(symbol).append(ts, price, size);
    }

    /// Feed a chart-equity bar (cumulative volume) into the rolling window.
    pub fn feed_chart_bar(&mut self, symbol: &str, ts: Instant, price: f64, cum_volume: i64) {
        self.window_for(symbol).feed_chart_bar(ts, price, cum_volume);
    }

    /// Process one incoming L2 book tick for `symbol` at wall-clock `now`,
    /// implementing the ten-step algorithm from the component design.
    /// Returns `Some(AlertCandidate)` iff all gating conditions hold.
    pub fn process_book(&mut self, symbol: &str, payload: &Value, now: Instant) -> Option<AlertCandidate> {
        // 1. Normalize.
        let book = book::normalize(payload, symbol);
        let summary = book.summarize();

        // 2-4. Aggregate per venue and compute BookMetrics from valid venues.
        let cells = aggregate_venues(&book);
        let metrics = compute_metrics(&cells, self.params.max_range_cents);

        // Rolling window bookkeeping: synthesize a fallback print if no real
        // trade/chart data has arrived for 30s.
        let window = self.window_for(symbol);
        window.prune(now);
        let l1_price = self.last_l1.get(symbol).and_then(|q| q.resolved_price());
        let fallback_price = l1_price
            .or_else(|| if summary.top_bid > 0.0 { Some(summary.top_bid) } else { None })
            .or_else(|| if summary.top_ask > 0.0 { Some(summary.top_ask) } else { None })
            .unwrap_or(0.0);
        let estimated_size = (summary.total_bid_volume + summary.total_ask_volume) / 2;
        window.maybe_synthesize_fallback(now, fallback_price, estimated_size);
        let vol_per_min = window.summarize(now).vol_per_min;

        // 5. Candidate direction.
        let direction = determine_direction(&metrics, self.params.disable_bid_heavy)?;

        // 6. Append to the symbol's ring.
        let ring = self.rings.entry(symbol.to_string()).or_default();
        ring.push(now, direction);

        // 7. Dwell time.
        let dwell = ring.dwell_time(now, direction);

        debug!(
            symbol,
            direction = %direction,
            valid_exchanges = metrics.valid_exchanges,
            vol_per_min,
            dwell_secs = dwell.as_secs_f64(),
            "imbalance candidate observed"
        );

        // 8. Gating conditions.
        if dwell < Duration::from_secs(self.params.min_imbalance_duration_sec) {
            return None;
        }
        let required_exchanges = self.params.min_ask_heavy.max(self.params.min_bid_heavy);
        if metrics.valid_exchanges < required_exchanges {
            return None;
        }
        if vol_per_min < self.params.min_volume {
            return None;
        }
        if let Some(last) = self.last_alert.get(symbol) {
            if now.duration_since(*last) < Duration::from_secs(self.params.alert_throttle_sec) {
                return None;
            }
        }

        // 9. Price resolution: L1 LAST_PRICE -> L1 BID/ASK/CLOSE -> midpoint.
        let price = l1_price.or_else(|| {
            if summary.top_bid > 0.0 && summary.top_ask > 0.0 {
                Some((summary.top_bid + summary.top_ask) / 2.0)
            } else {
                None
            }
        })?;

        let (ratio, heavy_venues) = match direction {
            Direction::AskHeavy => (metrics.ask_to_bid_ratio, metrics.ask_heavy_venues),
            Direction::BidHeavy => (metrics.bid_to_ask_ratio, metrics.bid_heavy_venues),
        };

        self.last_alert.insert(symbol.to_string(), now);

        Some(AlertCandidate {
            symbol: symbol.to_string(),
            direction,
            ratio,
            total_bids: metrics.total_bids,
            total_asks: metrics.total_asks,
            heavy_venues,
            price,
            exchanges: metrics.per_venue.keys().copied().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::BookRow;

    fn params() -> DetectorParams {
        DetectorParams {
            window_seconds: 60,
            min_ask_heavy: 6,
            min_bid_heavy: 6,
            max_range_cents: 1,
            alert_throttle_sec: 60,
            min_volume: 100_000.0,
            min_imbalance_duration_sec: 10,
            disable_bid_heavy: false,
        }
    }

    fn ask_heavy_book() -> Book {
        let mut book = Book::default();
        let venues = [
            VenueCode::Nyse,
            VenueCode::Nasdaq,
            VenueCode::Memx,
            VenueCode::Iex,
            VenueCode::NyseArca,
            VenueCode::CboeEdgx,
        ];
        for v in venues {
            book.bids.push(BookRow { venue: v, price: 13.35, size: 100 });
            book.asks.push(BookRow { venue: v, price: 13.36, size: 900 });
        }
        // One balanced venue so bid_heavy_venues stays at 1 per the scenario.
        book.bids.push(BookRow { venue: VenueCode::Miax, price: 13.35, size: 900 });
        book.asks.push(BookRow { venue: VenueCode::Miax, price: 13.36, size: 100 });
        book
    }

    fn venue_cells_from(book: &Book) -> HashMap<VenueCode, VenueCell> {
        aggregate_venues(book)
    }

    #[test]
    fn metrics_count_only_valid_spread_venues() {
        let mut book = Book::default();
        book.bids.push(BookRow { venue: VenueCode::Nyse, price: 10.00, size: 100 });
        book.asks.push(BookRow { venue: VenueCode::Nyse, price: 10.05, size: 100 }); // 5c spread, excluded
        book.bids.push(BookRow { venue: VenueCode::Nasdaq, price: 10.00, size: 100 });
        book.asks.push(BookRow { venue: VenueCode::Nasdaq, price: 10.01, size: 100 }); // 1c spread, included
        let cells = venue_cells_from(&book);
        let metrics = compute_metrics(&cells, 1);
        assert_eq!(metrics.valid_exchanges, 1);
        assert_eq!(metrics.total_bids, 100);
    }

    #[test]
    fn direction_requires_gap_of_four() {
        let metrics = BookMetrics {
            total_bids: 0,
            total_asks: 0,
            ask_to_bid_ratio: 1.0,
            bid_to_ask_ratio: 1.0,
            ask_heavy_venues: 5,
            bid_heavy_venues: 2,
            valid_exchanges: 7,
            per_venue: HashMap::new(),
        };
        assert_eq!(determine_direction(&metrics, false), None);

        let metrics2 = BookMetrics { ask_heavy_venues: 6, bid_heavy_venues: 1, ..metrics };
        assert_eq!(determine_direction(&metrics2, false), Some(Direction::AskHeavy));
    }

    #[test]
    fn bid_heavy_can_be_globally_disabled() {
        let metrics = BookMetrics {
            total_bids: 0,
            total_asks: 0,
            ask_to_bid_ratio: 1.0,
            bid_to_ask_ratio: 1.0,
            ask_heavy_venues: 0,
            bid_heavy_venues: 6,
            valid_exchanges: 6,
            per_venue: HashMap::new(),
        };
        assert_eq!(determine_direction(&metrics, false), Some(Direction::BidHeavy));
        assert_eq!(determine_direction(&metrics, true), None);
    }

    #[test]
    fn s1_ask_heavy_alert_fires_after_dwell() {
        // Scenario S1: five ticks at t=0,2,4,6,8 then t=10; dwell=8 at t=8
        // (no alert), dwell=10 at t=10 (alert fires).
        let mut detector = Detector::new(params());
        let t0 = Instant::now();
        detector.update_l1("F", L1Quote { last_price: Some(13.35), ..Default::default() });
        detector.feed_trade("F", t0, 13.35, 200_000);

        let payload = book_payload(&ask_heavy_book());
        for i in [0u64, 2, 4, 6, 8] {
            let result = detector.process_book("F", &payload, t0 + Duration::from_secs(i));
            assert!(result.is_none(), "unexpected alert at t={i}");
        }
        let result = detector.process_book("F", &payload, t0 + Duration::from_secs(10));
        let alert = result.expect("alert should fire at t=10");
        assert_eq!(alert.direction, Direction::AskHeavy);
        assert_eq!(alert.price, 13.35);
    }

    #[test]
    fn s6_spread_filter_excludes_a_venue() {
        let mut book = Book::default();
        book.bids.push(BookRow { venue: VenueCode::Nyse, price: 10.00, size: 100 });
        book.asks.push(BookRow { venue: VenueCode::Nyse, price: 10.05, size: 100 });
        book.bids.push(BookRow { venue: VenueCode::Nasdaq, price: 10.00, size: 100 });
        book.asks.push(BookRow { venue: VenueCode::Nasdaq, price: 10.01, size: 100 });
        let cells = venue_cells_from(&book);
        let metrics = compute_metrics(&cells, 1);
        assert_eq!(metrics.valid_exchanges, 1);
        assert!(!metrics.per_venue.contains_key(&VenueCode::Nyse));
        assert!(metrics.per_venue.contains_key(&VenueCode::Nasdaq));
    }

    fn book_payload(book: &Book) -> Value {
        use serde_json::json;
        let bids: Vec<Value> = book
            .bids
            .iter()
            .map(|r| json!({ "BID_PRICE": r.price, "BIDS": [ { "EXCHANGE": r.venue.as_str(), "BID_VOLUME": r.size } ] }))
            .collect();
        let asks: Vec<Value> = book
            .asks
            .iter()
            .map(|r| json!({ "ASK_PRICE": r.price, "ASKS": [ { "EXCHANGE": r.venue.as_str(), "ASK_VOLUME": r.size } ] }))
            .collect();
        json!({ "BIDS": bids, "ASKS": asks })
    }
}
