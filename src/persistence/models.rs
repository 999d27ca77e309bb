//! Row structs and conversions between durable records and domain
//! entities.

use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::position::{Position, PositionState};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct PositionRecord {
    pub symbol: String,
    pub mode: String,
    pub stock_name: Option<String>,
    pub entry_price: f64,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    pub atr_at_entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_stop: f64,
    pub highest_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub state: String,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<String>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    pub fn into_position(self) -> Result<Position, String> {
        let mode: TradingMode = self.mode.parse()?;
        let state: PositionState = self.state.parse()?;
        let exit_reason = match self.exit_reason {
            Some(r) => Some(r.parse()?),
            None => None,
        };
        Ok(Position {
            symbol: self.symbol,
            mode,
            stock_name: self.stock_name,
            entry_price: self.entry_price,
            quantity: self.quantity,
            entry_time: self.entry_time,
            atr_at_entry: self.atr_at_entry,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            trailing_stop: self.trailing_stop,
            highest_price: self.highest_price,
            state,
            exit_price: self.exit_price,
            exit_reason,
            exit_time: self.exit_time,
            realized_pnl: self.realized_pnl,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OrderStateRecord {
    pub idempotency_key: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: String,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub remaining_qty: i64,
    pub order_no: Option<String>,
    pub fill_price: f64,
    pub status: String,
    pub mode: String,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderStateRecord {
    pub fn status_parsed(&self) -> crate::domain::entities::order::OrderStatus {
        self.status
            .parse()
            .unwrap_or(crate::domain::entities::order::OrderStatus::Failed)
    }
}

/// Insert shape for a fresh `PENDING` order row.
#[derive(Debug, Clone)]
pub struct CreateOrderState {
    pub idempotency_key: String,
    pub signal_id: String,
    pub symbol: String,
    pub side: String,
    pub requested_qty: i64,
    pub mode: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub idempotency_key: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub quantity: i64,
    pub executed_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub entry_price: Option<f64>,
    pub holding_days: Option<i64>,
    pub order_no: Option<String>,
    pub mode: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct AccountSnapshotRecord {
    pub snapshot_time: DateTime<Utc>,
    pub mode: String,
    pub total_equity: f64,
    pub cash: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub position_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SymbolCacheRecord {
    pub stock_code: String,
    pub stock_name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailySummaryRecord {
    pub summary_date: NaiveDate,
    pub mode: String,
    pub trades_count: i64,
    pub realized_pnl: f64,
    pub win_count: i64,
    pub loss_count: i64,
    pub updated_at: DateTime<Utc>,
}
