// =============================================================================
// Alert Log — append-only durable store, rowid as the monotonic alert id
// =============================================================================
//
// The only cross-component shared-mutable resource in the process: one
// `rusqlite::Connection` behind a `parking_lot::Mutex`, WAL mode, native
// rowid kept deliberately (no `WITHOUT ROWID`) because rowid *is* the
// monotonic alert id everything downstream depends on. Reserving an id and
// inserting the row happen inside one critical section under the same lock,
// so the reserve-then-insert race the design notes call out cannot occur
// within this process.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::imbalance::AlertCandidate;
use crate::types::{Direction, OrderStatus, Side};

/// A durable alert record: an `AlertCandidate` plus its reserved id and
/// wall-clock timestamp.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub timestamp: f64,
    pub symbol: String,
    pub direction: Direction,
    pub ratio: f64,
    pub total_bids: u64,
    pub total_asks: u64,
    pub heavy_venues: u32,
    pub price: f64,
    pub exchanges: Vec<String>,
}

/// One row in the orders audit table: the outcome of acting on an alert.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub alert_id: i64,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub timestamp: f64,
}

pub struct AlertLog {
    conn: Arc<Mutex<Connection>>,
}

impl AlertLog {
    /// Open (or create) the database at `path`, apply durability pragmas,
    /// and ensure both tables exist.
    pub fn open(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS alerts (
                timestamp    REAL NOT NULL,
                symbol       TEXT NOT NULL,
                ratio        REAL NOT NULL,
                total_bids   INTEGER NOT NULL,
                total_asks   INTEGER NOT NULL,
                heavy_venues INTEGER NOT NULL,
                direction    TEXT NOT NULL,
                price        REAL NOT NULL,
                exchanges    TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS orders (
                alert_id  INTEGER NOT NULL,
                order_id  TEXT NOT NULL,
                symbol    TEXT NOT NULL,
                side      TEXT NOT NULL,
                qty       REAL NOT NULL,
                price     REAL NOT NULL,
                status    TEXT NOT NULL,
                timestamp REAL NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Open an in-memory database, used by tests and the inline-only mode's
    /// warm-start path.
    #[cfg(test)]
    fn open_in_memory() -> rusqlite::Result<Self> {
        Self::open(":memory:")
    }

    /// Reserve the next monotonic id (`MAX(rowid)+1`) and insert the alert
    /// under it in one critical section, returning the durable `Alert`.
    ///
    /// Callers that need to dispatch *before* the row is durably appended
    /// (per the component design's inline-first ordering) should call
    /// `reserve_id` and `append_with_id` separately instead.
    #[instrument(skip(self, candidate), name = "alert_log_append")]
    pub fn append(&self, candidate: &AlertCandidate, timestamp: f64) -> rusqlite::Result<Alert> {
        let guard = self.conn.lock();
        let id = Self::next_id_locked(&guard)?;
        Self::insert_locked(&guard, id, candidate, timestamp)?;
        Ok(Self::to_alert(id, candidate, timestamp))
    }

    /// Reserve the next id without inserting, for the inline-dispatch-first
    /// ordering: dispatch gets the id immediately, the row lands afterward.
    pub fn reserve_id(&self) -> rusqlite::Result<i64> {
        let guard = self.conn.lock();
        Self::next_id_locked(&guard)
    }

    /// Insert a row under a previously reserved id.
    pub fn append_with_id(&self, id: i64, candidate: &AlertCandidate, timestamp: f64) -> rusqlite::Result<Alert> {
        let guard = self.conn.lock();
        Self::insert_locked(&guard, id, candidate, timestamp)?;
        Ok(Self::to_alert(id, candidate, timestamp))
    }

    fn next_id_locked(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row("SELECT IFNULL(MAX(rowid), 0) + 1 FROM alerts", [], |row| row.get(0))
    }

    fn insert_locked(conn: &Connection, id: i64, candidate: &AlertCandidate, timestamp: f64) -> rusqlite::Result<()> {
        let exchanges = candidate
            .exchanges
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        conn.execute(
            "INSERT INTO alerts (rowid, timestamp, symbol, ratio, total_bids, total_asks, heavy_venues, direction, price, exchanges)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                timestamp,
                candidate.symbol,
                candidate.ratio,
                candidate.total_bids as i64,
                candidate.total_asks as i64,
                candidate.heavy_venues,
                candidate.direction.to_string(),
                candidate.price,
                exchanges,
            ],
        )?;
        Ok(())
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

    /// The highest existing alert id, or 0 if the table is empty.
    pub fn max_id(&self) -> rusqlite::Result<i64> {
        let guard = self.conn.lock();
        guard.query_row("SELECT IFNULL(MAX(rowid), 0) FROM alerts", [], |row| row.get(0))
    }

    /// Scan every alert with id strictly greater than `after_id`, ordered by
    /// id ascending, used by the tail-poll dispatch loop to resume. Runs off
    /// the cooperative runtime via `spawn_blocking` since a wide catch-up
    /// scan after a restart can hold the connection mutex for a while —
    /// the same treatment the reference backend gives its own multi-row
    /// history queries.
    pub async fn scan(&self, after_id: i64) -> rusqlite::Result<Vec<Alert>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let mut stmt = guard.prepare(
                "SELECT rowid, timestamp, symbol, ratio, total_bids, total_asks, heavy_venues, direction, price, exchanges
                 FROM alerts WHERE rowid > ?1 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map(params![after_id], |row| {
                let direction_str: String = row.get(7)?;
                let exchanges_str: String = row.get(9)?;
                Ok(Alert {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    symbol: row.get(2)?,
                    ratio: row.get(3)?,
                    total_bids: row.get::<_, i64>(4)? as u64,
                    total_asks: row.get::<_, i64>(5)? as u64,
                    heavy_venues: row.get(6)?,
                    direction: if direction_str == "ask-heavy" { Direction::AskHeavy } else { Direction::BidHeavy },
                    price: row.get(8)?,
                    exchanges: if exchanges_str.is_empty() {
                        Vec::new()
                    } else {
                        exchanges_str.split(',').map(|s| s.to_string()).collect()
                    },
                })
            })?;
            rows.collect()
        })
        .await
        .expect("alert log scan task panicked")
    }

    /// Look up one alert by id, used to resolve an alert id back into its
    /// record before a decision is made on it.
    pub fn get(&self, id: i64) -> rusqlite::Result<Option<Alert>> {
        let guard = self.conn.lock();
        guard
            .query_row(
                "SELECT rowid, timestamp, symbol, ratio, total_bids, total_asks, heavy_venues, direction, price, exchanges
                 FROM alerts WHERE rowid = ?1",
                params![id],
                |row| {
                    let direction_str: String = row.get(7)?;
                    let exchanges_str: String = row.get(9)?;
                    Ok(Alert {
                        id: row.get(0)?,
                        timestamp: row.get(1)?,
                        symbol: row.get(2)?,
                        ratio: row.get(3)?,
                        total_bids: row.get::<_, i64>(4)? as u64,
                        total_asks: row.get::<_, i64>(5)? as u64,
                        heavy_venues: row.get(6)?,
                        direction: if direction_str == "ask-heavy" { Direction::AskHeavy } else { Direction::BidHeavy },
                        price: row.get(8)?,
                        exchanges: if exchanges_str.is_empty() {
                            Vec::new()
                        } else {
                            exchanges_str.split(',').map(|s| s.to_string()).collect()
                        },
                    })
                },
            )
            .optional()
    }

    /// Append one order-audit row.
    pub fn record_order(&self, order: &OrderRecord) -> rusqlite::Result<()> {
        let guard = self.conn.lock();
        guard.execute(
            "INSERT INTO orders (alert_id, order_id, symbol, side, qty, price, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                order.alert_id,
                order.order_id,
                order.symbol,
                order.side.to_string(),
                order.qty,
                order.price,
                order.status.to_string(),
                order.timestamp,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VenueCode;

    fn candidate(symbol: &str) -> AlertCandidate {
        AlertCandidate {
            symbol: symbol.to_string(),
            direction: Direction::AskHeavy,
            ratio: 6.0,
            total_bids: 100,
            total_asks: 600,
            heavy_venues: 6,
            price: 13.35,
            exchanges: vec![VenueCode::Nyse, VenueCode::Nasdaq],
        }
    }

    #[test]
    fn append_assigns_monotonic_ids() {
        let log = AlertLog::open_in_memory().unwrap();
        let a1 = log.append(&candidate("F"), 1000.0).unwrap();
        let a2 = log.append(&candidate("F"), 1001.0).unwrap();
        assert_eq!(a1.id, 1);
        assert_eq!(a2.id, 2);
        assert_eq!(log.max_id().unwrap(), 2);
    }

    #[test]
    fn reserve_then_append_with_id_matches_direct_append() {
        let log = AlertLog::open_in_memory().unwrap();
        let id = log.reserve_id().unwrap();
        assert_eq!(id, 1);
        let alert = log.append_with_id(id, &candidate("F"), 1000.0).unwrap();
        assert_eq!(alert.id, 1);
        assert_eq!(log.max_id().unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_returns_rows_after_cursor_in_order() {
        let log = AlertLog::open_in_memory().unwrap();
        log.append(&candidate("F"), 1.0).unwrap();
        log.append(&candidate("QQQ"), 2.0).unwrap();
        log.append(&candidate("SPY"), 3.0).unwrap();
        let rows = log.scan(1).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "QQQ");
        assert_eq!(rows[1].symbol, "SPY");
    }

    #[test]
    fn get_round_trips_exchanges() {
        let log = AlertLog::open_in_memory().unwrap();
        let appended = log.append(&candidate("F"), 1.0).unwrap();
        let fetched = log.get(appended.id).unwrap().expect("row present");
        assert_eq!(fetched.exchanges, vec!["NYSE".to_string(), "NASDAQ".to_string()]);
    }

    #[test]
    fn record_order_persists_audit_row() {
        let log = AlertLog::open_in_memory().unwrap();
        log.record_order(&OrderRecord {
            alert_id: 1,
            order_id: "o-1".into(),
            symbol: "F".into(),
            side: Side::Buy,
            qty: 1000.0,
            price: 13.35,
            status: OrderStatus::Filled,
            timestamp: 1.0,
        })
        .unwrap();
    }
}
