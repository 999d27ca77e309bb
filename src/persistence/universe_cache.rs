//! Daily universe cache file.
//!
//! One record per trade date at `data/universe_cache.json`. Intraday
//! restarts reuse the record verbatim; a selection-method change between
//! runs invalidates it immediately.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseRecord {
    pub trade_date: NaiveDate,
    pub selection_method: String,
    pub stocks: Vec<String>,
    /// Holdings observed when the record was created, kept for audit.
    pub holdings_at_creation: Vec<String>,
    pub cache_key: String,
}

pub struct UniverseCacheFile {
    path: PathBuf,
}

impl UniverseCacheFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        UniverseCacheFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Today's record, but only if both the date and the selection method
    /// match what was cached.
    pub fn read_for(&self, trade_date: NaiveDate, selection_method: &str) -> Option<UniverseRecord> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let record: UniverseRecord = serde_json::from_str(&text).ok()?;
        if record.trade_date != trade_date || record.selection_method != selection_method {
            return None;
        }
        Some(record)
    }

    pub fn write(
        &self,
        trade_date: NaiveDate,
        selection_method: &str,
        stocks: &[String],
        holdings: &[String],
    ) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = UniverseRecord {
            trade_date,
            selection_method: selection_method.to_string(),
            stocks: stocks.to_vec(),
            holdings_at_creation: holdings.to_vec(),
            cache_key: trade_date.to_string(),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&record).unwrap_or_default())?;
        std::fs::rename(&tmp, &self.path)
    }
}
