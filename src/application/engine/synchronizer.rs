//! Order synchronizer.
//!
//! The single entry point for opening or closing a position. Guarantees:
//! submit-once via a content-hash idempotency key, confirmed fills before
//! any state update, and one database transaction per decision covering
//! `order_state`, `trades` and `positions`. A process killed mid-flight
//! resumes through the durable order row instead of resubmitting.

use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::order::{idempotency_key, OrderSide, OrderStatus, OrderType};
use crate::domain::entities::position::{Position, PositionState};
use crate::domain::entities::trade::{ExitReason, Trade};
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker::{Broker, ExecutionReport, ExecutionStatus};
use crate::domain::repositories::notifier::{Notifier, Severity};
use crate::persistence::models::{CreateOrderState, OrderStateRecord};
use crate::persistence::repository::{
    OrderStateRepository, PositionRepository, TradeRepository,
};
use crate::persistence::DbPool;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BuyDecision {
    pub symbol: String,
    pub qty: i64,
    pub signal_id: String,
    pub reference_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub atr_at_entry: f64,
    pub stock_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SellDecision {
    pub symbol: String,
    pub qty: i64,
    pub signal_id: String,
    pub reference_price: f64,
    pub reason: ExitReason,
}

/// Final, fill-confirmed outcome of one decision.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub avg_price: f64,
    pub order_no: Option<String>,
    pub idempotency_key: String,
}

impl SyncResult {
    fn from_record(record: &OrderStateRecord) -> Self {
        SyncResult {
            status: record.status_parsed(),
            filled_qty: record.filled_qty,
            avg_price: record.fill_price,
            order_no: record.order_no.clone(),
            idempotency_key: record.idempotency_key.clone(),
        }
    }
}

/// A SELL deferred because the market was closed or the symbol was not
/// orderable. Retried after the backoff or when the market reopens.
#[derive(Debug, Clone)]
pub struct PendingExit {
    pub reason: ExitReason,
    pub denial: String,
    pub since: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

pub struct OrderSynchronizer {
    broker: Arc<dyn Broker>,
    pool: DbPool,
    mode: TradingMode,
    notifier: Arc<dyn Notifier>,
    execution_timeout: Duration,
    pending_exit_backoff: chrono::Duration,
    pending_exits: Mutex<HashMap<String, PendingExit>>,
}

impl OrderSynchronizer {
    pub fn new(
        broker: Arc<dyn Broker>,
        pool: DbPool,
        mode: TradingMode,
        notifier: Arc<dyn Notifier>,
        execution_timeout: Duration,
        pending_exit_backoff: Duration,
    ) -> Self {
        OrderSynchronizer {
            broker,
            pool,
            mode,
            notifier,
            execution_timeout,
            pending_exit_backoff: chrono::Duration::from_std(pending_exit_backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            pending_exits: Mutex::new(HashMap::new()),
        }
    }

    fn orders(&self) -> OrderStateRepository {
        OrderStateRepository::new(self.pool.clone(), self.mode)
    }

    fn positions(&self) -> PositionRepository {
        PositionRepository::new(self.pool.clone(), self.mode)
    }

    fn notify_submit_failure(&self, symbol: &str, key: &str, reason: &str) {
        self.notifier.notify(
            Severity::Error,
            "order_submit_failed",
            json!({
                "symbol": symbol,
                "idempotency_key": key,
                "mode": self.mode.as_str(),
                "reason": reason,
            }),
        );
    }

    // ════════════════════════════════════════════════════════════════
    // Buy path
    // ════════════════════════════════════════════════════════════════

    pub async fn execute_buy(&self, decision: &BuyDecision) -> Result<SyncResult, EngineError> {
        let key = idempotency_key(
            self.mode,
            OrderSide::Buy,
            &decision.symbol,
            decision.qty,
            &decision.signal_id,
        );
        let orders = self.orders();

        let mut adopted_order_no: Option<String> = None;
        match orders.get(&key).await? {
            Some(existing) if existing.status_parsed().is_terminal() => {
                info!(
                    "[SYNC] buy already terminal ({}): {}",
                    existing.status, key
                );
                return Ok(SyncResult::from_record(&existing));
            }
            Some(existing) => {
                // In-flight row from a previous run: adopt, never resubmit.
                info!("[SYNC] adopting in-flight buy ({}): {}", existing.status, key);
                adopted_order_no = existing.order_no.clone();
            }
            None => {
                orders
                    .insert_pending(&CreateOrderState {
                        idempotency_key: key.clone(),
                        signal_id: decision.signal_id.clone(),
                        symbol: decision.symbol.clone(),
                        side: OrderSide::Buy.as_str().to_string(),
                        requested_qty: decision.qty,
                        mode: self.mode.as_str().to_string(),
                    })
                    .await?;
            }
        }

        // Position row is created PENDING at submit and promoted on fill;
        // a restart recovers the frozen levels from it.
        self.upsert_pending_position(decision).await?;

        if self.mode == TradingMode::DryRun {
            return self.finalize_dry_run_buy(&key, decision).await;
        }

        let order_no = match adopted_order_no {
            Some(order_no) => order_no,
            None => {
                let ack = match self
                    .broker
                    .place_buy(&decision.symbol, decision.qty, 0, OrderType::Market)
                    .await
                {
                    Ok(ack) => ack,
                    Err(e) => {
                        orders.mark_failed(&key).await?;
                        self.notify_submit_failure(&decision.symbol, &key, &e.to_string());
                        return Ok(SyncResult {
                            status: OrderStatus::Failed,
                            filled_qty: 0,
                            avg_price: 0.0,
                            order_no: None,
                            idempotency_key: key,
                        });
                    }
                };
                if !ack.accepted {
                    orders.mark_failed(&key).await?;
                    self.notify_submit_failure(&decision.symbol, &key, &ack.message);
                    return Ok(SyncResult {
                        status: OrderStatus::Failed,
                        filled_qty: 0,
                        avg_price: 0.0,
                        order_no: None,
                        idempotency_key: key,
                    });
                }
                orders.mark_submitted(&key, &ack.order_no).await?;
                ack.order_no
            }
        };

        let report = self
            .broker
            .wait_for_execution(&order_no, decision.qty, self.execution_timeout)
            .await?;
        self.settle_buy(&key, &order_no, decision, &report).await
    }

    async fn upsert_pending_position(&self, decision: &BuyDecision) -> Result<(), EngineError> {
        // An already-entered position must not be overwritten by a pending
        // shell (the uniqueness invariant lives on ENTERED rows).
        if let Some(existing) = self.positions().get(&decision.symbol).await? {
            if existing.state == PositionState::Entered {
                return Ok(());
            }
        }
        let mut position = Position::entered(
            &decision.symbol,
            self.mode,
            decision.reference_price,
            decision.qty,
            decision.atr_at_entry,
            decision.stop_loss,
            decision.take_profit,
            Utc::now(),
        );
        position.state = PositionState::Pending;
        position.stock_name = decision.stock_name.clone();
        self.positions().upsert(&position).await?;
        Ok(())
    }

    async fn finalize_dry_run_buy(
        &self,
        key: &str,
        decision: &BuyDecision,
    ) -> Result<SyncResult, EngineError> {
        let report = ExecutionReport {
            status: ExecutionStatus::Filled,
            filled_qty: decision.qty,
            avg_price: decision.reference_price,
        };
        info!(
            "[SYNC] dry-run buy filled virtually: {} x{} @ {:.0}",
            decision.symbol, decision.qty, decision.reference_price
        );
        self.settle_buy(key, "DRY-RUN", decision, &report).await
    }

    /// Persist the confirmed outcome of a buy in one transaction.
    async fn settle_buy(
        &self,
        key: &str,
        order_no: &str,
        decision: &BuyDecision,
        report: &ExecutionReport,
    ) -> Result<SyncResult, EngineError> {
        let now = Utc::now();
        let (status, filled_qty, avg_price) = match report.status {
            ExecutionStatus::Filled => (OrderStatus::Filled, report.filled_qty, report.avg_price),
            ExecutionStatus::Partial => (OrderStatus::Partial, report.filled_qty, report.avg_price),
            ExecutionStatus::Cancelled => (OrderStatus::Cancelled, 0, 0.0),
            ExecutionStatus::Timeout => {
                // Cancel was not confirmed by the client; try once more and
                // classify from what we know.
                if let Err(e) = self.broker.cancel_order(order_no).await {
                    warn!("[SYNC] cancel after timeout failed: {}", e);
                }
                if report.filled_qty > 0 {
                    (OrderStatus::Partial, report.filled_qty, report.avg_price)
                } else {
                    (OrderStatus::Cancelled, 0, 0.0)
                }
            }
        };

        let mut tx = self.pool.begin().await.map_err(EngineError::from)?;
        OrderStateRepository::finalize_tx(&mut tx, key, status, filled_qty, avg_price).await?;

        if filled_qty > 0 {
            let trade = Trade {
                idempotency_key: key.to_string(),
                symbol: decision.symbol.clone(),
                side: OrderSide::Buy,
                price: avg_price,
                quantity: filled_qty,
                executed_at: now,
                reason: if self.mode == TradingMode::DryRun {
                    Some(ExitReason::SignalOnly)
                } else {
                    None
                },
                pnl: None,
                pnl_pct: None,
                entry_price: None,
                holding_days: None,
                order_no: Some(order_no.to_string()),
            };
            let inserted = TradeRepository::insert_tx(&mut tx, &trade, self.mode).await?;

            if inserted {
                let mut position = Position::entered(
                    &decision.symbol,
                    self.mode,
                    avg_price,
                    filled_qty,
                    decision.atr_at_entry,
                    decision.stop_loss,
                    decision.take_profit,
                    now,
                );
                position.stock_name = decision.stock_name.clone();
                PositionRepository::upsert_tx(&mut tx, &position).await?;
            }
        }

        tx.commit().await.map_err(EngineError::from)?;

        info!(
            "[SYNC] buy settled {}: {} filled {}/{} @ {:.0}",
            status, decision.symbol, filled_qty, decision.qty, avg_price
        );
        Ok(SyncResult {
            status,
            filled_qty,
            avg_price,
            order_no: Some(order_no.to_string()),
            idempotency_key: key.to_string(),
        })
    }

    // ════════════════════════════════════════════════════════════════
    // Sell path
    // ════════════════════════════════════════════════════════════════

    pub async fn execute_sell(&self, decision: &SellDecision) -> Result<SyncResult, EngineError> {
        let key = idempotency_key(
            self.mode,
            OrderSide::Sell,
            &decision.symbol,
            decision.qty,
            &decision.signal_id,
        );
        let orders = self.orders();

        let position = self
            .positions()
            .get(&decision.symbol)
            .await?
            .filter(|p| p.state == PositionState::Entered)
            .ok_or_else(|| {
                EngineError::Store(format!("no open position to sell: {}", decision.symbol))
            })?;

        let mut adopted_order_no: Option<String> = None;
        match orders.get(&key).await? {
            Some(existing) if existing.status_parsed().is_terminal() => {
                info!(
                    "[SYNC] sell already terminal ({}): {}",
                    existing.status, key
                );
                return Ok(SyncResult::from_record(&existing));
            }
            Some(existing) => {
                info!("[SYNC] adopting in-flight sell ({}): {}", existing.status, key);
                adopted_order_no = existing.order_no.clone();
            }
            None => {
                orders
                    .insert_pending(&CreateOrderState {
                        idempotency_key: key.clone(),
                        signal_id: decision.signal_id.clone(),
                        symbol: decision.symbol.clone(),
                        side: OrderSide::Sell.as_str().to_string(),
                        requested_qty: decision.qty,
                        mode: self.mode.as_str().to_string(),
                    })
                    .await?;
            }
        }

        if self.mode == TradingMode::DryRun {
            let report = ExecutionReport {
                status: ExecutionStatus::Filled,
                filled_qty: decision.qty,
                avg_price: decision.reference_price,
            };
            return self
                .settle_sell(&key, "DRY-RUN", decision, &position, &report)
                .await;
        }

        let order_no = match adopted_order_no {
            Some(order_no) => order_no,
            None => {
                let ack = match self
                    .broker
                    .place_sell(&decision.symbol, decision.qty, 0, OrderType::Market)
                    .await
                {
                    Ok(ack) => ack,
                    Err(e) => {
                        orders.mark_failed(&key).await?;
                        self.notify_submit_failure(&decision.symbol, &key, &e.to_string());
                        return Ok(SyncResult {
                            status: OrderStatus::Failed,
                            filled_qty: 0,
                            avg_price: 0.0,
                            order_no: None,
                            idempotency_key: key,
                        });
                    }
                };
                if !ack.accepted {
                    orders.mark_failed(&key).await?;
                    self.notify_submit_failure(&decision.symbol, &key, &ack.message);
                    return Ok(SyncResult {
                        status: OrderStatus::Failed,
                        filled_qty: 0,
                        avg_price: 0.0,
                        order_no: None,
                        idempotency_key: key,
                    });
                }
                orders.mark_submitted(&key, &ack.order_no).await?;
                ack.order_no
            }
        };

        let report = self
            .broker
            .wait_for_execution(&order_no, decision.qty, self.execution_timeout)
            .await?;
        self.settle_sell(&key, &order_no, decision, &position, &report)
            .await
    }

    async fn settle_sell(
        &self,
        key: &str,
        order_no: &str,
        decision: &SellDecision,
        position: &Position,
        report: &ExecutionReport,
    ) -> Result<SyncResult, EngineError> {
        let now = Utc::now();
        let (status, filled_qty, avg_price) = match report.status {
            ExecutionStatus::Filled => (OrderStatus::Filled, report.filled_qty, report.avg_price),
            ExecutionStatus::Partial => (OrderStatus::Partial, report.filled_qty, report.avg_price),
            ExecutionStatus::Cancelled => (OrderStatus::Cancelled, 0, 0.0),
            ExecutionStatus::Timeout => {
                if let Err(e) = self.broker.cancel_order(order_no).await {
                    warn!("[SYNC] cancel after timeout failed: {}", e);
                }
                if report.filled_qty > 0 {
                    (OrderStatus::Partial, report.filled_qty, report.avg_price)
                } else {
                    (OrderStatus::Cancelled, 0, 0.0)
                }
            }
        };

        let mut tx = self.pool.begin().await.map_err(EngineError::from)?;
        OrderStateRepository::finalize_tx(&mut tx, key, status, filled_qty, avg_price).await?;

        if filled_qty > 0 {
            let pnl = (avg_price - position.entry_price) * filled_qty as f64;
            let pnl_pct = if position.entry_price > 0.0 {
                (avg_price - position.entry_price) / position.entry_price * 100.0
            } else {
                0.0
            };
            let trade = Trade {
                idempotency_key: key.to_string(),
                symbol: decision.symbol.clone(),
                side: OrderSide::Sell,
                price: avg_price,
                quantity: filled_qty,
                executed_at: now,
                reason: Some(decision.reason),
                pnl: Some(pnl),
                pnl_pct: Some(pnl_pct),
                entry_price: Some(position.entry_price),
                holding_days: Some(position.holding_days(now)),
                order_no: Some(order_no.to_string()),
            };
            let inserted = TradeRepository::insert_tx(&mut tx, &trade, self.mode).await?;

            if inserted {
                if filled_qty >= position.quantity {
                    PositionRepository::mark_exited_tx(
                        &mut tx,
                        &decision.symbol,
                        self.mode,
                        avg_price,
                        decision.reason.as_str(),
                        pnl,
                        now,
                    )
                    .await?;
                } else {
                    // Remainder stays open with the reduced quantity.
                    PositionRepository::reduce_quantity_tx(
                        &mut tx,
                        &decision.symbol,
                        self.mode,
                        filled_qty,
                    )
                    .await?;
                }
            }
        }

        tx.commit().await.map_err(EngineError::from)?;

        if filled_qty > 0 {
            if let Some(pending) = self.clear_pending_exit(&decision.symbol) {
                self.notifier.notify(
                    Severity::Info,
                    "pending_exit_resolved",
                    json!({
                        "symbol": decision.symbol,
                        "mode": self.mode.as_str(),
                        "reason": pending.reason.as_str(),
                        "deferred_since": pending.since.to_rfc3339(),
                    }),
                );
            }
        }

        info!(
            "[SYNC] sell settled {}: {} filled {}/{} @ {:.0} ({})",
            status,
            decision.symbol,
            filled_qty,
            decision.qty,
            avg_price,
            decision.reason
        );
        Ok(SyncResult {
            status,
            filled_qty,
            avg_price,
            order_no: Some(order_no.to_string()),
            idempotency_key: key.to_string(),
        })
    }

    // ════════════════════════════════════════════════════════════════
    // Pending exits
    // ════════════════════════════════════════════════════════════════

    pub fn register_pending_exit(&self, symbol: &str, reason: ExitReason, denial: &str) {
        let mut map = self.pending_exits.lock().unwrap();
        map.entry(symbol.to_string()).or_insert_with(|| {
            warn!("[SYNC] exit deferred for {}: {}", symbol, denial);
            PendingExit {
                reason,
                denial: denial.to_string(),
                since: Utc::now(),
                last_attempt: None,
            }
        });
    }

    /// Symbols whose deferred exit is due for another attempt.
    pub fn due_pending_exits(&self, now: DateTime<Utc>) -> Vec<(String, ExitReason)> {
        let mut map = self.pending_exits.lock().unwrap();
        let mut due = Vec::new();
        for (symbol, pending) in map.iter_mut() {
            let ready = match pending.last_attempt {
                None => true,
                Some(at) => now - at >= self.pending_exit_backoff,
            };
            if ready {
                pending.last_attempt = Some(now);
                due.push((symbol.clone(), pending.reason));
            }
        }
        due
    }

    pub fn has_pending_exit(&self, symbol: &str) -> bool {
        self.pending_exits.lock().unwrap().contains_key(symbol)
    }

    fn clear_pending_exit(&self, symbol: &str) -> Option<PendingExit> {
        self.pending_exits.lock().unwrap().remove(symbol)
    }

    // ════════════════════════════════════════════════════════════════
    // Recovery and hygiene
    // ════════════════════════════════════════════════════════════════

    /// Resume orders a previous process submitted but never settled. Runs
    /// at startup before the first cycle.
    pub async fn resume_open_orders(&self) -> Result<usize, EngineError> {
        let rows = self.orders().recoverable().await?;
        let count = rows.len();
        for row in rows {
            let Some(order_no) = row.order_no.clone() else {
                continue;
            };
            info!(
                "[SYNC] resuming {} {} order {} (status {})",
                row.side, row.symbol, order_no, row.status
            );
            let report = self
                .broker
                .wait_for_execution(&order_no, row.requested_qty, self.execution_timeout)
                .await?;

            match row.side.parse::<OrderSide>() {
                Ok(OrderSide::Buy) => {
                    let decision = self.rebuild_buy_decision(&row).await?;
                    self.settle_buy(&row.idempotency_key, &order_no, &decision, &report)
                        .await?;
                }
                Ok(OrderSide::Sell) => {
                    let position = self
                        .positions()
                        .get(&row.symbol)
                        .await?
                        .filter(|p| p.state == PositionState::Entered);
                    match position {
                        Some(position) => {
                            let decision = SellDecision {
                                symbol: row.symbol.clone(),
                                qty: row.requested_qty,
                                signal_id: row.signal_id.clone(),
                                reference_price: report.avg_price,
                                reason: ExitReason::Manual,
                            };
                            self.settle_sell(
                                &row.idempotency_key,
                                &order_no,
                                &decision,
                                &position,
                                &report,
                            )
                            .await?;
                        }
                        None => {
                            warn!(
                                "[SYNC] resumed sell {} has no open position; recording order only",
                                row.idempotency_key
                            );
                            let status = match report.status {
                                ExecutionStatus::Filled => OrderStatus::Filled,
                                ExecutionStatus::Partial => OrderStatus::Partial,
                                _ => OrderStatus::Cancelled,
                            };
                            let mut tx = self.pool.begin().await.map_err(EngineError::from)?;
                            OrderStateRepository::finalize_tx(
                                &mut tx,
                                &row.idempotency_key,
                                status,
                                report.filled_qty,
                                report.avg_price,
                            )
                            .await?;
                            tx.commit().await.map_err(EngineError::from)?;
                        }
                    }
                }
                Err(e) => warn!("[SYNC] skipping unreadable order row: {}", e),
            }
        }
        Ok(count)
    }

    /// Recover the entry context for a resumed buy from the position row
    /// persisted at submit time.
    async fn rebuild_buy_decision(
        &self,
        row: &OrderStateRecord,
    ) -> Result<BuyDecision, EngineError> {
        let pending = self.positions().get(&row.symbol).await?;
        match pending {
            Some(p) => Ok(BuyDecision {
                symbol: row.symbol.clone(),
                qty: row.requested_qty,
                signal_id: row.signal_id.clone(),
                reference_price: p.entry_price,
                stop_loss: p.stop_loss,
                take_profit: p.take_profit,
                atr_at_entry: p.atr_at_entry,
                stock_name: p.stock_name.clone(),
            }),
            None => {
                // Entry context is gone; the reconciler adopts the holding
                // from the broker on its next pass.
                warn!(
                    "[SYNC] no cached entry context for resumed buy {}",
                    row.idempotency_key
                );
                Ok(BuyDecision {
                    symbol: row.symbol.clone(),
                    qty: row.requested_qty,
                    signal_id: row.signal_id.clone(),
                    reference_price: 0.0,
                    stop_loss: 0.0,
                    take_profit: 0.0,
                    atr_at_entry: 0.0,
                    stock_name: None,
                })
            }
        }
    }

    /// Cancel abandoned order rows. Runs at startup and periodically.
    pub async fn cleanup_stale_orders(&self) -> Result<u64, EngineError> {
        let cancelled = self.orders().cancel_stale(Utc::now()).await?;
        if cancelled > 0 {
            self.notifier.notify(
                Severity::Warning,
                "stale_orders_cancelled",
                json!({ "count": cancelled, "mode": self.mode.as_str() }),
            );
        }
        Ok(cancelled)
    }
}
