// =============================================================================
// Risk Guard — trade-rate limiter, kill-switch file, emergency flatten
// =============================================================================
//
// Generalizes the reference engine's `RwLock<Inner>`/daily-reset/Debug-impl
// circuit-breaker idiom from four capital breakers down to the three rules
// this system actually needs: a rolling trade-rate limiter, a kill-switch
// file check run before every decision cycle, and an emergency-shutdown
// routine that cancels everything outstanding and flattens every non-zero
// position before the process exits non-zero.
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::executor::OrderExecutor;
use crate::state::TraderState;
use crate::types::Side;

/// Width of the trade-rate limiter's rolling window.
const RATE_WINDOW: Duration = Duration::from_secs(3600);

struct Inner {
    trade_timestamps: VecDeque<Instant>,
    tripped: bool,
}

/// Snapshot of the guard's current state, e.g. for a dashboard or log line.
#[derive(Debug, Clone, Copy)]
pub struct RiskSnapshot {
    pub trades_in_window: usize,
    pub max_trades_per_hour: u32,
    pub tripped: bool,
}

pub struct RiskGuard {
    state: RwLock<Inner>,
    max_trades_per_hour: u32,
    kill_switch_path: PathBuf,
}

impl RiskGuard {
    pub fn new(max_trades_per_hour: u32, kill_switch_path: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::new(Inner { trade_timestamps: VecDeque::new(), tripped: false }),
            max_trades_per_hour,
            kill_switch_path: kill_switch_path.into(),
        }
    }

    /// Whether the guard has already tripped and halted trading.
    pub fn is_tripped(&self) -> bool {
        self.state.read().tripped
    }

    /// Record a confirmed fill's timestamp and check the rolling trade-rate
    /// limit. Returns `Err(EngineError::RateExceeded)` once the count of
    /// fills within the last `RATE_WINDOW` exceeds `max_trades_per_hour`.
    pub fn record_fill(&self, now: Instant) -> Result<(), EngineError> {
        let mut s = self.state.write();
        s.trade_timestamps.push_back(now);
        while let Some(&front) = s.trade_timestamps.front() {
            if now.duration_since(front) > RATE_WINDOW {
                s.trade_timestamps.pop_front();
            } else {
                break;
            }
        }
        let count = s.trade_timestamps.len() as u32;
        if count > self.max_trades_per_hour {
            s.tripped = true;
            return Err(EngineError::RateExceeded { count, limit: self.max_trades_per_hour });
        }
        Ok(())
    }

    /// Check the configured kill-switch path. Existence alone trips the
    /// guard regardless of contents; called before each decision cycle.
    pub fn check_kill_switch(&self) -> Result<(), EngineError> {
        if self.kill_switch_path.exists() {
            self.state.write().tripped = true;
            return Err(EngineError::KillSwitch { path: self.kill_switch_path.display().to_string() });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let s = self.state.read();
        RiskSnapshot {
            trades_in_window: s.trade_timestamps.len(),
            max_trades_per_hour: self.max_trades_per_hour,
            tripped: s.tripped,
        }
    }

    /// Cancel everything outstanding, flatten every non-zero position with a
    /// market order in the closing direction, persist the (now-flat) state,
    /// and terminate the process with a non-zero exit code.
    ///
    /// Never returns: this is the terminal action for `RateExceeded`,
    /// `KillSwitch`, and `BadFill` — the only error kinds the design marks
    /// surfaced-and-fatal rather than locally recovered.
    pub async fn emergency_shutdown(
        &self,
        executor: &Arc<dyn OrderExecutor>,
        trader_state: &mut TraderState,
        state_path: &Path,
        reason: &str,
    ) -> ! {
        error!(reason, "emergency shutdown engaged");
        self.state.write().tripped = true;

        if let Err(err) = executor.cancel_all_orders().await {
            warn!(error = %err, "cancel_all_orders failed during emergency shutdown");
        }

        let positions: Vec<(String, f64)> =
            trader_state.positions.iter().map(|(s, q)| (s.clone(), *q)).collect();
        for (symbol, qty) in positions {
            let side = if qty > 0.0 { Side::Sell } else { Side::Cover };
            let flatten_qty = qty.abs();
            info!(symbol, side = %side, qty = flatten_qty, "flattening position during emergency shutdown");
            match executor.submit_market(&symbol, side, flatten_qty).await {
                Ok(result) => {
                    trader_state.apply_delta(&symbol, side.position_sign() * result.filled_quantity.max(flatten_qty));
                }
                Err(err) => {
                    error!(symbol, error = %err, "failed to flatten position during emergency shutdown");
                }
            }
        }

        if let Err(err) = trader_state.save(state_path) {
            error!(error = %err, "failed to persist state during emergency shutdown");
        }

        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_trips_after_configured_count() {
        let guard = RiskGuard::new(3, "/nonexistent/kill_switch_file_for_tests");
        let t0 = Instant::now();
        for i in 0..3u64 {
            assert!(guard.record_fill(t0 + Duration::from_secs(i)).is_ok());
        }
        let err = guard.record_fill(t0 + Duration::from_secs(4)).unwrap_err();
        match err {
            EngineError::RateExceeded { count, limit } => {
                assert_eq!(count, 4);
                assert_eq!(limit, 3);
            }
            other => panic!("expected RateExceeded, got {other:?}"),
        }
        assert!(guard.is_tripped());
    }

    #[test]
    fn rate_limiter_prunes_fills_outside_the_rolling_window() {
        let guard = RiskGuard::new(2, "/nonexistent/kill_switch_file_for_tests");
        let t0 = Instant::now();
        assert!(guard.record_fill(t0).is_ok());
        assert!(guard.record_fill(t0 + Duration::from_secs(10)).is_ok());
        // Past the 3600s window: the first fill should have aged out.
        let t_later = t0 + Duration::from_secs(4000);
        assert!(guard.record_fill(t_later).is_ok());
        assert_eq!(guard.snapshot().trades_in_window, 2);
    }

    #[test]
    fn kill_switch_trips_on_file_presence_only() {
        let path = std::env::temp_dir().join(format!("kill-switch-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let guard = RiskGuard::new(100, &path);
        assert!(guard.check_kill_switch().is_ok());

        std::fs::write(&path, "").unwrap();
        let err = guard.check_kill_switch().unwrap_err();
        assert!(matches!(err, EngineError::KillSwitch { .. }));
        assert!(guard.is_tripped());

        let _ = std::fs::remove_file(&path);
    }
}
