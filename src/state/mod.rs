//! Durable bot state: total profit, trade ledger, last price, grid bounds.
//!
//! The engine is the sole writer of the state file. Saves go through a temp
//! file plus rename so concurrent readers never observe a torn write.

use crate::error::{EngineError, EngineResult};
use crate::model::Trade;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk bot state. Field names are the file format contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub total_profit: f64,
    pub trades: Vec<Trade>,
    pub last_update: String,
    pub price_range: [f64; 2],
    pub grid_number: u32,
    pub last_price: Option<f64>,
}

impl PersistedState {
    /// Sum of realized profit over the ledger. Must match `total_profit`;
    /// the startup reconciliation re-derives the total from this when they
    /// disagree.
    pub fn ledger_total(&self) -> f64 {
        self.trades.iter().map(|t| t.realized_profit).sum()
    }
}

/// Per-symbol JSON persistence with atomic writes.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("grid_state_{}.json", symbol))
    }

    /// Loads prior state. A missing file is a fresh start, not an error;
    /// unparseable content is fatal so months of profit history are never
    /// silently replaced with zeros.
    pub fn load(&self, symbol: &str) -> EngineResult<Option<PersistedState>> {
        let path = self.path_for(symbol);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No existing state file at {:?}, starting fresh", path);
                return Ok(None);
            }
            Err(e) => {
                return Err(EngineError::CorruptState {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        let state: PersistedState =
            serde_json::from_str(&content).map_err(|e| EngineError::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        info!(
            "Loaded state from {:?}: {} trades, total profit {:.4}",
            path,
            state.trades.len(),
            state.total_profit
        );
        Ok(Some(state))
    }

    /// Saves atomically: write a temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, symbol: &str, state: &PersistedState) -> EngineResult<()> {
        let path = self.path_for(symbol);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = temp_path_for(&path);
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &path)?;

        debug!("State saved to {:?}", path);
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderSide;
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        PersistedState {
            total_profit: 0.065,
            trades: vec![
                Trade {
                    timestamp: "2024-05-01T10:00:00Z".to_string(),
                    side: OrderSide::Buy,
                    price: 0.795,
                    quantity: 13.0,
                    counterpart_price: 0.800,
                    realized_profit: 0.0,
                    running_total_profit: 0.0,
                },
                Trade {
                    timestamp: "2024-05-01T11:00:00Z".to_string(),
                    side: OrderSide::Sell,
                    price: 0.800,
                    quantity: 13.0,
                    counterpart_price: 0.795,
                    realized_profit: 0.065,
                    running_total_profit: 0.065,
                },
            ],
            last_update: "2024-05-01T11:00:00Z".to_string(),
            price_range: [0.785, 0.815],
            grid_number: 3,
            last_price: Some(0.801),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = sample_state();

        store.save("ADAUSDT", &state).unwrap();
        let loaded = store.load("ADAUSDT").unwrap().unwrap();

        assert_eq!(loaded, state);
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load("ADAUSDT").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path_for("ADAUSDT"), "{ not json").unwrap();

        let err = store.load("ADAUSDT").unwrap_err();
        assert!(matches!(err, EngineError::CorruptState { .. }));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save("ADAUSDT", &sample_state()).unwrap();

        let temp = temp_path_for(&store.path_for("ADAUSDT"));
        assert!(!temp.exists());
        assert!(store.path_for("ADAUSDT").exists());
    }

    #[test]
    fn test_state_file_field_names() {
        let json = serde_json::to_string(&sample_state()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for field in [
            "total_profit",
            "trades",
            "last_update",
            "price_range",
            "grid_number",
            "last_price",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(value["trades"][1]["side"], "SELL");
        assert_eq!(value["price_range"][0], 0.785);
    }

    #[test]
    fn test_ledger_total() {
        let state = sample_state();
        assert!((state.ledger_total() - state.total_profit).abs() < 1e-12);
    }
}
