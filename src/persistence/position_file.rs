//! File mirror of open positions.
//!
//! `data/positions.json` holds a mode-namespaced array of open positions
//! mirroring the `positions` table. It is the fast-recovery copy the
//! reconciler checks against the broker and the store on startup.

use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::position::Position;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

pub struct PositionFileStore {
    path: PathBuf,
    mode: TradingMode,
}

impl PositionFileStore {
    pub fn new(path: impl AsRef<Path>, mode: TradingMode) -> Self {
        PositionFileStore {
            path: path.as_ref().to_path_buf(),
            mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Map<String, Value> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default(),
            Err(_) => Map::new(),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash mid-write cannot corrupt the file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(doc).unwrap_or_default())?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Open positions cached for this mode. A missing or unreadable file
    /// reads as empty; the broker remains the source of truth.
    pub fn load(&self) -> Vec<Position> {
        let doc = self.read_document();
        let Some(entries) = doc.get(self.mode.as_str()).and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|v| match serde_json::from_value::<Position>(v.clone()) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("[FILE] skipping unreadable cached position: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Replace this mode's slice; other modes' entries are preserved.
    pub fn save(&self, positions: &[Position]) -> std::io::Result<()> {
        let mut doc = self.read_document();
        let entries: Vec<Value> = positions
            .iter()
            .filter_map(|p| serde_json::to_value(p).ok())
            .collect();
        doc.insert(self.mode.as_str().to_string(), Value::Array(entries));
        self.write_document(&doc)
    }

    pub fn remove_symbol(&self, symbol: &str) -> std::io::Result<()> {
        let remaining: Vec<Position> = self
            .load()
            .into_iter()
            .filter(|p| p.symbol != symbol)
            .collect();
        self.save(&remaining)
    }

    pub fn clear(&self) -> std::io::Result<()> {
        self.save(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pos(symbol: &str, mode: TradingMode) -> Position {
        Position::entered(symbol, mode, 70_000.0, 10, 1_500.0, 67_000.0, 74_500.0, Utc::now())
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionFileStore::new(dir.path().join("positions.json"), TradingMode::Paper);

        store.save(&[pos("005930", TradingMode::Paper)]).unwrap();
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol, "005930");
        assert_eq!(loaded[0].atr_at_entry, 1_500.0);
    }

    #[test]
    fn test_modes_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let paper = PositionFileStore::new(&path, TradingMode::Paper);
        let real = PositionFileStore::new(&path, TradingMode::Real);

        paper.save(&[pos("005930", TradingMode::Paper)]).unwrap();
        real.save(&[pos("000660", TradingMode::Real)]).unwrap();

        assert_eq!(paper.load().len(), 1);
        assert_eq!(real.load().len(), 1);

        real.clear().unwrap();
        assert_eq!(paper.load().len(), 1);
        assert!(real.load().is_empty());
    }

    #[test]
    fn test_remove_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionFileStore::new(dir.path().join("positions.json"), TradingMode::Paper);
        store
            .save(&[pos("005930", TradingMode::Paper), pos("000660", TradingMode::Paper)])
            .unwrap();

        store.remove_symbol("005930").unwrap();
        let loaded = store.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].symbol, "000660");
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionFileStore::new(dir.path().join("nope.json"), TradingMode::Paper);
        assert!(store.load().is_empty());
    }
}
