//! Broker capability trait.
//!
//! A common interface over the brokerage surface the engine needs: quotes,
//! daily bars, account balance, market orders, fill polling and cancels.
//! Implementations are pluggable (REST client, test fake) so the core
//! depends only on the capability set.

use crate::domain::entities::candle::DailyBar;
use crate::domain::entities::order::OrderType;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// Retryable failure of a non-order call (network, 5xx, rate limit).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Order submission rejected or failed. Never auto-retried.
    #[error("order submit failed: {0}")]
    Submit(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no quote available for {0}")]
    NoQuote(String),

    #[error("order cancel failed: {0}")]
    Cancel(String),
}

/// Latest trade snapshot for one symbol.
#[derive(Debug, Clone)]
pub struct Quote {
    pub symbol: String,
    pub current_price: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub volume: i64,
    pub change_rate: f64,
}

#[derive(Debug, Clone)]
pub struct Holding {
    pub stock_code: String,
    pub stock_name: String,
    pub quantity: i64,
    pub avg_price: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone)]
pub struct AccountBalance {
    pub cash: f64,
    pub total_equity: f64,
    pub total_pnl: f64,
    pub holdings: Vec<Holding>,
}

/// Result of an order submission. Acceptance is never treated as a fill.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub accepted: bool,
    pub order_no: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Filled,
    Partial,
    Cancelled,
    /// Fill wait expired and the final status query itself failed.
    Timeout,
}

/// Outcome of waiting for an order to execute. Fill quantities are reported
/// cumulatively by the broker.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub filled_qty: i64,
    pub avg_price: f64,
}

/// One row of the traded-value ranking used by universe selection.
#[derive(Debug, Clone)]
pub struct VolumeRankRow {
    pub stock_code: String,
    pub stock_name: String,
    pub trade_value: f64,
    pub volume: i64,
    pub market_cap: Option<f64>,
    pub change_rate: f64,
    pub is_suspended: bool,
    pub is_management: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest trade price and session open. A zero price means "no quote".
    async fn get_current_price(&self, symbol: &str) -> BrokerResult<Quote>;

    /// Daily bars in descending trading-day order, at most `count` rows.
    async fn get_daily_ohlcv(&self, symbol: &str, count: usize) -> BrokerResult<Vec<DailyBar>>;

    /// Cash plus per-symbol holdings. May serve a short-lived cached value.
    async fn get_account_balance(&self) -> BrokerResult<AccountBalance>;

    /// Submit a buy. `price` 0 means market order.
    async fn place_buy(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
    ) -> BrokerResult<OrderAck>;

    /// Submit a sell. `price` 0 means market order.
    async fn place_sell(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
    ) -> BrokerResult<OrderAck>;

    /// Poll the order until it fills or `timeout` elapses. On expiry the
    /// implementation cancels any remainder and reports what actually
    /// executed.
    async fn wait_for_execution(
        &self,
        order_no: &str,
        expected_qty: i64,
        timeout: Duration,
    ) -> BrokerResult<ExecutionReport>;

    /// Best-effort cancel.
    async fn cancel_order(&self, order_no: &str) -> BrokerResult<()>;

    /// Traded-value ranking for universe selection.
    async fn volume_ranking(&self, top_n: usize) -> BrokerResult<Vec<VolumeRankRow>>;

    /// True once requests have been failing continuously for the outage
    /// window (60 s). The execution loop aborts cycles while set.
    fn is_network_outage(&self) -> bool {
        false
    }
}
