//! Daily universe lifecycle.
//!
//! Selects the day's entry candidates once per trade date, caches the
//! record for intraday restarts, and separates holdings-to-manage from
//! entry candidates. Selection failure walks a fallback chain: today's
//! cache, then the fixed list, then the empty set; in REAL mode a
//! fallback can be configured to halt trading instead.

use crate::domain::entities::mode::TradingMode;
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker::Broker;
use crate::domain::services::strategy::wilder_atr;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::persistence::universe_cache::UniverseCacheFile;

/// Symbols moving more than this in one session are excluded from the
/// volume ranking (limit-up/down churn).
const MAX_SESSION_CHANGE_PCT: f64 = 28.0;
const ATR_FILTER_MIN_BARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    Fixed,
    VolumeTop,
    AtrFilter,
    Combined,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Fixed => "fixed",
            SelectionMethod::VolumeTop => "volume_top",
            SelectionMethod::AtrFilter => "atr_filter",
            SelectionMethod::Combined => "combined",
        }
    }
}

impl std::str::FromStr for SelectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(SelectionMethod::Fixed),
            "volume_top" => Ok(SelectionMethod::VolumeTop),
            "atr_filter" => Ok(SelectionMethod::AtrFilter),
            "combined" => Ok(SelectionMethod::Combined),
            other => Err(format!("unknown selection method: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UniverseConfig {
    pub method: SelectionMethod,
    pub max_stocks: usize,
    pub fixed_stocks: Vec<String>,
    pub min_volume: i64,
    pub min_market_cap: Option<f64>,
    pub min_atr_pct: f64,
    pub max_atr_pct: f64,
    pub atr_period: usize,
    pub halt_on_fallback_in_real: bool,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        UniverseConfig {
            method: SelectionMethod::Fixed,
            max_stocks: 5,
            fixed_stocks: Vec::new(),
            min_volume: 100_000,
            min_market_cap: None,
            min_atr_pct: 1.0,
            max_atr_pct: 8.0,
            atr_period: 14,
            halt_on_fallback_in_real: true,
        }
    }
}

/// A candidate code is a 6-digit numeric KRX symbol.
pub fn is_valid_symbol(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| c.is_ascii_digit())
}

pub struct UniverseService {
    broker: Arc<dyn Broker>,
    cache: UniverseCacheFile,
    cfg: UniverseConfig,
    mode: TradingMode,
}

impl UniverseService {
    pub fn new(
        broker: Arc<dyn Broker>,
        cache: UniverseCacheFile,
        cfg: UniverseConfig,
        mode: TradingMode,
    ) -> Self {
        UniverseService {
            broker,
            cache,
            cfg,
            mode,
        }
    }

    /// Today's universe. A cached record for this trade date and method is
    /// reused verbatim; otherwise selection runs and the result is cached.
    pub async fn todays_universe(
        &self,
        trade_date: NaiveDate,
        holdings: &[String],
    ) -> Result<Vec<String>, EngineError> {
        if let Some(record) = self.cache.read_for(trade_date, self.cfg.method.as_str()) {
            info!(
                "[UNIVERSE] reusing cached universe for {}: {:?}",
                trade_date, record.stocks
            );
            return Ok(record.stocks);
        }

        match self.select().await {
            // A selection that filtered everything out is a failure, not a
            // universe; the final count must match what is available.
            Ok(symbols) if symbols.is_empty() => {
                self.fallback(
                    trade_date,
                    holdings,
                    "selection produced no candidates".to_string(),
                )
                .await
            }
            Ok(symbols) => {
                if let Err(e) =
                    self.cache
                        .write(trade_date, self.cfg.method.as_str(), &symbols, holdings)
                {
                    warn!("[UNIVERSE] cache write failed: {}", e);
                }
                info!(
                    "[UNIVERSE] {} method={} -> {:?}",
                    trade_date,
                    self.cfg.method.as_str(),
                    symbols
                );
                Ok(symbols)
            }
            Err(e) => self.fallback(trade_date, holdings, e.to_string()).await,
        }
    }

    async fn fallback(
        &self,
        trade_date: NaiveDate,
        holdings: &[String],
        cause: String,
    ) -> Result<Vec<String>, EngineError> {
        if self.mode == TradingMode::Real && self.cfg.halt_on_fallback_in_real {
            return Err(EngineError::UniverseHalted(format!(
                "selection failed in REAL mode: {}",
                cause
            )));
        }

        if let Some(record) = self.cache.read_for(trade_date, self.cfg.method.as_str()) {
            warn!("[UNIVERSE] selection failed ({}); using today's cache", cause);
            return Ok(record.stocks);
        }

        if !self.cfg.fixed_stocks.is_empty() {
            let symbols = self.sanitize(self.cfg.fixed_stocks.clone());
            warn!("[UNIVERSE] selection failed ({}); using fixed list", cause);
            let _ = self
                .cache
                .write(trade_date, self.cfg.method.as_str(), &symbols, holdings);
            return Ok(symbols);
        }

        warn!("[UNIVERSE] selection failed ({}); universe is empty", cause);
        Ok(Vec::new())
    }

    async fn select(&self) -> Result<Vec<String>, EngineError> {
        let symbols = match self.cfg.method {
            SelectionMethod::Fixed => self.cfg.fixed_stocks.clone(),
            SelectionMethod::VolumeTop => self.select_volume_top(self.cfg.max_stocks).await?,
            SelectionMethod::AtrFilter => {
                let pool = if self.cfg.fixed_stocks.is_empty() {
                    self.select_volume_top(3 * self.cfg.max_stocks).await?
                } else {
                    self.cfg.fixed_stocks.clone()
                };
                self.filter_by_atr(pool).await?
            }
            SelectionMethod::Combined => {
                let pool = self.select_volume_top(3 * self.cfg.max_stocks).await?;
                self.filter_by_atr(pool).await?
            }
        };
        Ok(self.sanitize(symbols))
    }

    async fn select_volume_top(&self, limit: usize) -> Result<Vec<String>, EngineError> {
        let mut rows = self.broker.volume_ranking(limit * 2).await?;
        rows.retain(|row| {
            if row.is_suspended || row.is_management {
                return false;
            }
            if row.volume < self.cfg.min_volume {
                return false;
            }
            if row.change_rate.abs() >= MAX_SESSION_CHANGE_PCT {
                return false;
            }
            if let (Some(floor), Some(cap)) = (self.cfg.min_market_cap, row.market_cap) {
                if cap < floor {
                    return false;
                }
            }
            true
        });
        rows.sort_by(|a, b| {
            b.trade_value
                .partial_cmp(&a.trade_value)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| r.stock_code)
            .collect())
    }

    /// Keep symbols whose ATR/close ratio sits inside the configured band.
    async fn filter_by_atr(&self, pool: Vec<String>) -> Result<Vec<String>, EngineError> {
        let mut kept = Vec::new();
        for symbol in pool {
            let bars = match self.broker.get_daily_ohlcv(&symbol, 60).await {
                Ok(bars) => bars,
                Err(e) => {
                    warn!("[UNIVERSE] bars unavailable for {}: {}", symbol, e);
                    continue;
                }
            };
            if bars.len() < ATR_FILTER_MIN_BARS {
                continue;
            }
            let mut asc = bars.clone();
            asc.sort_by_key(|b| b.date);
            let close = asc.last().map(|b| b.close).unwrap_or(0.0);
            if close <= 0.0 {
                continue;
            }
            let Some(atr) = wilder_atr(&asc, self.cfg.atr_period) else {
                continue;
            };
            let ratio = atr / close * 100.0;
            if ratio >= self.cfg.min_atr_pct && ratio <= self.cfg.max_atr_pct {
                kept.push(symbol);
            }
        }
        Ok(kept)
    }

    /// Validate, dedupe preserving order, truncate to `max_stocks`.
    fn sanitize(&self, symbols: Vec<String>) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for symbol in symbols {
            let symbol = symbol.trim().to_string();
            if !is_valid_symbol(&symbol) {
                warn!("[UNIVERSE] dropping invalid candidate: {:?}", symbol);
                continue;
            }
            if seen.insert(symbol.clone()) {
                out.push(symbol);
            }
            if out.len() == self.cfg.max_stocks {
                break;
            }
        }
        out
    }

    /// Symbols eligible for new entries: today's universe minus holdings.
    pub fn entry_candidates(universe: &[String], holdings: &[String]) -> Vec<String> {
        let held: BTreeSet<&String> = holdings.iter().collect();
        universe
            .iter()
            .filter(|s| !held.contains(s))
            .cloned()
            .collect()
    }
}
