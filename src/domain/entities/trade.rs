use crate::domain::entities::order::OrderSide;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a position was (or would be) closed. `SignalOnly` marks rows written
/// in dry-run mode where no broker order exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    AtrStop,
    TakeProfit,
    TrailingStop,
    TrendBroken,
    GapProtection,
    Manual,
    SignalOnly,
    /// Position-only classification: the reconciler closed a local row the
    /// broker no longer holds.
    RecoveredMissing,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::AtrStop => "ATR_STOP",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TrendBroken => "TREND_BROKEN",
            ExitReason::GapProtection => "GAP_PROTECTION",
            ExitReason::Manual => "MANUAL",
            ExitReason::SignalOnly => "SIGNAL_ONLY",
            ExitReason::RecoveredMissing => "RECOVERED_MISSING",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ATR_STOP" => Ok(ExitReason::AtrStop),
            "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
            "TRAILING_STOP" => Ok(ExitReason::TrailingStop),
            "TREND_BROKEN" => Ok(ExitReason::TrendBroken),
            "GAP_PROTECTION" => Ok(ExitReason::GapProtection),
            "MANUAL" => Ok(ExitReason::Manual),
            "SIGNAL_ONLY" => Ok(ExitReason::SignalOnly),
            "RECOVERED_MISSING" => Ok(ExitReason::RecoveredMissing),
            other => Err(format!("unknown exit reason: {}", other)),
        }
    }
}

/// An executed fill. Every trade corresponds to exactly one terminal order
/// row with the same idempotency key.
#[derive(Debug, Clone)]
pub struct Trade {
    pub idempotency_key: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: i64,
    pub executed_at: DateTime<Utc>,
    pub reason: Option<ExitReason>,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub entry_price: Option<f64>,
    pub holding_days: Option<i64>,
    pub order_no: Option<String>,
}
