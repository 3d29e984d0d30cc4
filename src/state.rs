// =============================================================================
// State Persistence — positions + last-processed-alert snapshot
// =============================================================================
//
// A `TraderState` snapshot is the only thing that survives a restart besides
// the Alert Log itself: the signed position per symbol and the last alert id
// the (tail-mode) dispatch cursor had reached. Saved with the same atomic
// write-tmp-then-rename idiom `runtime_config.rs`'s `RuntimeConfig::save`
// uses, so a crash mid-write never leaves a corrupt snapshot on disk.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Signed per-symbol positions plus the last alert id the trader has acted
/// on. A symbol absent from `positions` is flat; this invariant is
/// maintained by `set_position`, which removes the entry on a zero qty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraderState {
    #[serde(default)]
    pub positions: HashMap<String, f64>,
    #[serde(default)]
    pub last_alert_id: i64,
}

impl TraderState {
    /// Current signed quantity for `symbol`; 0.0 when flat.
    pub fn position_of(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }

    /// Apply a signed fill delta to `symbol`'s position, removing the entry
    /// entirely when it nets to flat so that `flat <=> not present` holds.
    pub fn apply_delta(&mut self, symbol: &str, delta: f64) {
        let new_qty = self.position_of(symbol) + delta;
        if new_qty.abs() < 1e-9 {
            self.positions.remove(symbol);
        } else {
            self.positions.insert(symbol.to_string(), new_qty);
        }
    }

    /// Load a snapshot from `path`. Missing file is not an error — a fresh
    /// process starts flat with `last_alert_id = 0`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no prior state snapshot, starting flat");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read state snapshot from {}", path.display()))?;
        let state: Self = serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "failed to parse state snapshot, starting flat");
            Self::default()
        });
        info!(
            path = %path.display(),
            positions = state.positions.len(),
            last_alert_id = state.last_alert_id,
            "state snapshot loaded"
        );
        Ok(state)
    }

    /// Persist the snapshot atomically (write to a `.tmp` sibling, then
    /// rename over the target path).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialize trader state")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_delta_removes_entry_when_flat() {
        let mut state = TraderState::default();
        state.apply_delta("F", 1000.0);
        assert_eq!(state.position_of("F"), 1000.0);
        state.apply_delta("F", -1000.0);
        assert_eq!(state.position_of("F"), 0.0);
        assert!(!state.positions.contains_key("F"));
    }

    #[test]
    fn load_missing_file_returns_default() {
        let path = std::env::temp_dir().join("does-not-exist-trader-state.json");
        let _ = std::fs::remove_file(&path);
        let state = TraderState::load(&path).unwrap();
        assert!(state.positions.is_empty());
        assert_eq!(state.last_alert_id, 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let path = std::env::temp_dir().join(format!("trader-state-test-{}.json", std::process::id()));
        let mut state = TraderState::default();
        state.apply_delta("F", -500.0);
        state.last_alert_id = 42;
        state.save(&path).unwrap();

        let loaded = TraderState::load(&path).unwrap();
        assert_eq!(loaded.position_of("F"), -500.0);
        assert_eq!(loaded.last_alert_id, 42);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let path = std::env::temp_dir().join(format!("trader-state-corrupt-{}.json", std::process::id()));
        std::fs::write(&path, "not json").unwrap();
        let state = TraderState::load(&path).unwrap();
        assert!(state.positions.is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
