// =============================================================================
// Rolling Window — per-symbol trade-print history with prune-by-time
// =============================================================================
//
// Two feeds populate the window: time-sale prints (used directly) and
// chart-equity bars (converted to a per-bar volume delta against the last
// cumulative volume seen). When neither has produced data for 30s, book
// updates synthesize at most one fallback print every 10s.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One trade print: a timestamp, price, and positive size.
#[derive(Debug, Clone, Copy)]
pub struct TradePrint {
    pub ts: Instant,
    pub price: f64,
    pub size: u64,
}

/// Result of summarizing a rolling window at a point in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowSummary {
    pub hi: f64,
    pub lo: f64,
    pub volume: u64,
    pub window_duration: Duration,
    pub vol_per_min: f64,
}

/// Maximum number of rolling aggregate volumes kept for smoothing.
const VOLUME_WINDOW_CAP: usize = 10;

/// Per-symbol rolling trade-print state.
pub struct RollingWindow {
    window_seconds: u64,
    prints: VecDeque<TradePrint>,
    volume_window: VecDeque<u64>,
    last_cum_volume: i64,
    last_trade_or_chart_ts: Option<Instant>,
    last_volume_fallback_ts: Option<Instant>,
}

impl RollingWindow {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window_seconds,
            prints: VecDeque::new(),
            volume_window: VecDeque::new(),
            last_cum_volume: 0,
            last_trade_or_chart_ts: None,
            last_volume_fallback_ts: None,
        }
    }

    /// Append a trade print and mark that real trade/chart data has arrived.
    pub fn append(&mut self, ts: Instant, price: f64, size: u64) {
        self.prints.push_back(TradePrint { ts, price, size });
        self.last_trade_or_chart_ts = Some(ts);
    }

    /// Feed one chart-equity bar. `cum_volume` is the bar's cumulative
    /// volume; only the delta against the last observed value is recorded.
    /// A negative delta (broker reset) clears the window entirely.
    pub fn feed_chart_bar(&mut self, ts: Instant, price: f64, cum_volume: i64) {
        let delta = cum_volume - self.last_cum_volume;
        if delta < 0 {
            self.prints.clear();
            self.volume_window.clear();
            self.last_cum_volume = cum_volume;
            return;
        }
        self.last_cum_volume = cum_volume;
        if delta > 0 {
            self.append(ts, price, delta as u64);
        }
    }

    /// Remove prints older than `window_seconds`.
    pub fn prune(&mut self, now: Instant) {
        let cutoff_secs = self.window_seconds;
        while let Some(front) = self.prints.front() {
            if now.duration_since(front.ts) > Duration::from_secs(cutoff_secs) {
                self.prints.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether real trade/chart data has arrived within the last 30s.
    pub fn has_recent_data(&self, now: Instant, gap: Duration) -> bool {
        match self.last_trade_or_chart_ts {
            Some(ts) => now.duration_since(ts) <= gap,
            None => false,
        }
    }

    /// If no real data has arrived for 30s, synthesize at most one fallback
    /// print every 10s from `estimated_size` (caller computes
    /// `(total_bids + total_asks) / 2`). Returns `true` if a print was
    /// synthesized.
    pub fn maybe_synthesize_fallback(&mut self, now: Instant, price: f64, estimated_size: u64) -> bool {
        let no_data_gap = Duration::from_secs(30);
        if self.has_recent_data(now, no_data_gap) {
            return false;
        }
        let min_fallback_interval = Duration::from_secs(10);
        if let Some(last) = self.last_volume_fallback_ts {
            if now.duration_since(last) < min_fallback_interval {
                return false;
            }
        }
        self.prints.push_back(TradePrint { ts: now, price, size: estimated_size });
        self.last_volume_fallback_ts = Some(now);
        true
    }

    /// Summarize the window as of `now`: high/low price, raw volume, smoothed
    /// volume-per-minute (mean over up to the last 10 rolling-window
    /// volumes), clamped window duration (minimum 1s).
    pub fn summarize(&mut self, now: Instant) -> WindowSummary {
        if self.prints.is_empty() {
            return WindowSummary::default();
        }

        let hi = self.prints.iter().map(|p| p.price).fold(f64::MIN, f64::max);
        let lo = self.prints.iter().map(|p| p.price).fold(f64::MAX, f64::min);
        let volume: u64 = self.prints.iter().map(|p| p.size).sum();

        self.volume_window.push_back(volume);
        while self.volume_window.len() > VOLUME_WINDOW_CAP {
            self.volume_window.pop_front();
        }
        let smoothed_vol = if self.volume_window.is_empty() {
            volume as f64
        } else {
            self.volume_window.iter().sum::<u64>() as f64 / self.volume_window.len() as f64
        };

        let oldest_ts = self.prints.front().map(|p| p.ts).unwrap_or(now);
        let raw_duration = now.duration_since(oldest_ts);
        let window_duration = raw_duration
            .min(Duration::from_secs(self.window_seconds))
            .max(Duration::from_secs(1));

        let vol_per_min = smoothed_vol / (window_duration.as_secs_f64() / 60.0);

        WindowSummary {
            hi,
            lo,
            volume,
            window_duration,
            vol_per_min,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_removes_stale_prints() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        w.append(t0, 10.0, 100);
        let t1 = t0 + Duration::from_secs(90);
        w.prune(t1);
        assert!(w.prints.is_empty());
    }

    #[test]
    fn summarize_smooths_volume_over_up_to_ten_windows() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        for i in 0..12u64 {
            w.append(t0, 10.0, 100);
            w.summarize(t0 + Duration::from_secs(i));
        }
        assert_eq!(w.volume_window.len(), 10);
    }

    #[test]
    fn chart_bar_negative_delta_clears_window() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        w.feed_chart_bar(t0, 10.0, 1000);
        assert_eq!(w.prints.len(), 1);
        w.feed_chart_bar(t0, 10.0, 200); // broker reset
        assert!(w.prints.is_empty());
        assert_eq!(w.last_cum_volume, 200);
    }

    #[test]
    fn chart_bar_positive_delta_appends_print() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        w.feed_chart_bar(t0, 10.0, 1000);
        w.feed_chart_bar(t0, 10.0, 1500);
        assert_eq!(w.prints.len(), 2);
        assert_eq!(w.prints.back().unwrap().size, 500);
    }

    #[test]
    fn fallback_synthesizes_at_most_once_per_ten_seconds() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        let t_gap = t0 + Duration::from_secs(31);
        assert!(w.maybe_synthesize_fallback(t_gap, 10.0, 50));
        assert!(!w.maybe_synthesize_fallback(t_gap + Duration::from_secs(5), 10.0, 50));
        assert!(w.maybe_synthesize_fallback(t_gap + Duration::from_secs(11), 10.0, 50));
    }

    #[test]
    fn window_duration_clamped_to_one_second_minimum() {
        let mut w = RollingWindow::new(60);
        let t0 = Instant::now();
        w.append(t0, 10.0, 100);
        let summary = w.summarize(t0);
        assert_eq!(summary.window_duration, Duration::from_secs(1));
    }
}
