//! Shared test doubles: a scriptable broker fake and small builders.
#![allow(dead_code)]

use async_trait::async_trait;
use kis_atr_trader::domain::entities::candle::DailyBar;
use kis_atr_trader::domain::entities::mode::TradingMode;
use kis_atr_trader::domain::entities::order::OrderType;
use kis_atr_trader::domain::entities::position::Position;
use kis_atr_trader::domain::repositories::broker::{
    AccountBalance, Broker, BrokerError, BrokerResult, ExecutionReport, ExecutionStatus, Holding,
    OrderAck, Quote, VolumeRankRow,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scriptable broker double. Orders are acknowledged with sequential order
/// numbers; fills come from the scripted execution report.
pub struct MockBroker {
    pub quotes: Mutex<HashMap<String, Quote>>,
    pub bars: Mutex<HashMap<String, Vec<DailyBar>>>,
    pub balance: Mutex<AccountBalance>,
    pub volume_rows: Mutex<Vec<VolumeRankRow>>,
    pub fail_volume_ranking: AtomicBool,
    pub reject_orders: AtomicBool,
    /// Execution report returned by `wait_for_execution`.
    pub execution: Mutex<ExecutionReport>,
    pub place_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    order_seq: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        MockBroker {
            quotes: Mutex::new(HashMap::new()),
            bars: Mutex::new(HashMap::new()),
            balance: Mutex::new(AccountBalance {
                cash: 10_000_000.0,
                total_equity: 10_000_000.0,
                total_pnl: 0.0,
                holdings: Vec::new(),
            }),
            volume_rows: Mutex::new(Vec::new()),
            fail_volume_ranking: AtomicBool::new(false),
            reject_orders: AtomicBool::new(false),
            execution: Mutex::new(ExecutionReport {
                status: ExecutionStatus::Filled,
                filled_qty: 0,
                avg_price: 0.0,
            }),
            place_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            order_seq: AtomicUsize::new(0),
        }
    }
}

impl MockBroker {
    pub fn script_fill(&self, status: ExecutionStatus, filled_qty: i64, avg_price: f64) {
        *self.execution.lock().unwrap() = ExecutionReport {
            status,
            filled_qty,
            avg_price,
        };
    }

    pub fn set_holdings(&self, holdings: Vec<Holding>) {
        self.balance.lock().unwrap().holdings = holdings;
    }

    pub fn placed_orders(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn cancelled_orders(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_current_price(&self, symbol: &str) -> BrokerResult<Quote> {
        self.quotes
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::NoQuote(symbol.to_string()))
    }

    async fn get_daily_ohlcv(&self, symbol: &str, count: usize) -> BrokerResult<Vec<DailyBar>> {
        let mut bars = self
            .bars
            .lock()
            .unwrap()
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        bars.truncate(count);
        Ok(bars)
    }

    async fn get_account_balance(&self) -> BrokerResult<AccountBalance> {
        Ok(self.balance.lock().unwrap().clone())
    }

    async fn place_buy(
        &self,
        _symbol: &str,
        _qty: i64,
        _price: i64,
        _order_type: OrderType,
    ) -> BrokerResult<OrderAck> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_orders.load(Ordering::SeqCst) {
            return Ok(OrderAck {
                accepted: false,
                order_no: String::new(),
                message: "insufficient buying power".to_string(),
            });
        }
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OrderAck {
            accepted: true,
            order_no: format!("ORD-{}", seq),
            message: String::new(),
        })
    }

    async fn place_sell(
        &self,
        symbol: &str,
        qty: i64,
        price: i64,
        order_type: OrderType,
    ) -> BrokerResult<OrderAck> {
        self.place_buy(symbol, qty, price, order_type).await
    }

    async fn wait_for_execution(
        &self,
        _order_no: &str,
        _expected_qty: i64,
        _timeout: Duration,
    ) -> BrokerResult<ExecutionReport> {
        Ok(self.execution.lock().unwrap().clone())
    }

    async fn cancel_order(&self, _order_no: &str) -> BrokerResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn volume_ranking(&self, top_n: usize) -> BrokerResult<Vec<VolumeRankRow>> {
        if self.fail_volume_ranking.load(Ordering::SeqCst) {
            return Err(BrokerError::Transient("ranking unavailable".to_string()));
        }
        let mut rows = self.volume_rows.lock().unwrap().clone();
        rows.truncate(top_n);
        Ok(rows)
    }
}

pub fn holding(code: &str, name: &str, qty: i64, avg_price: f64) -> Holding {
    Holding {
        stock_code: code.to_string(),
        stock_name: name.to_string(),
        quantity: qty,
        avg_price,
        current_price: avg_price,
    }
}

pub fn entered_position(symbol: &str, mode: TradingMode, entry: f64, qty: i64) -> Position {
    Position::entered(
        symbol,
        mode,
        entry,
        qty,
        1_500.0,
        entry - 3_000.0,
        entry + 4_500.0,
        chrono::Utc::now(),
    )
}
