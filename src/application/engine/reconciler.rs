//! Three-way position reconciliation.
//!
//! Runs at startup and after a network outage clears. The broker account
//! is the source of truth; the file cache and the store are repaired to
//! match it. Individual store failures inside the pass are soft: logged as
//! warnings, never fatal. Only the aggregate verdicts `UNTRACKED_HOLDING`
//! and `CRITICAL_MISMATCH` alert the operator.

use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::position::{Position, PositionState};
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker::{Broker, Holding};
use crate::domain::repositories::notifier::{Notifier, Severity};
use crate::persistence::position_file::PositionFileStore;
use crate::persistence::repository::{PositionRepository, SymbolCacheRepository};
use crate::persistence::DbPool;
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one pass, classified per symbol.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub matched: Vec<String>,
    pub untracked: Vec<String>,
    pub recovered_missing: Vec<String>,
    pub critical_mismatch: Vec<String>,
    pub soft_failures: Vec<String>,
}

impl ReconcileReport {
    /// True when broker, file and store already agreed everywhere.
    pub fn is_clean(&self) -> bool {
        self.untracked.is_empty()
            && self.recovered_missing.is_empty()
            && self.critical_mismatch.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        !self.untracked.is_empty() || !self.critical_mismatch.is_empty()
    }
}

pub struct PositionReconciler {
    broker: Arc<dyn Broker>,
    pool: DbPool,
    file: PositionFileStore,
    mode: TradingMode,
    notifier: Arc<dyn Notifier>,
}

impl PositionReconciler {
    pub fn new(
        broker: Arc<dyn Broker>,
        pool: DbPool,
        file: PositionFileStore,
        mode: TradingMode,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        PositionReconciler {
            broker,
            pool,
            file,
            mode,
            notifier,
        }
    }

    fn positions(&self) -> PositionRepository {
        PositionRepository::new(self.pool.clone(), self.mode)
    }

    /// Make local state converge to the broker account. Returns the pass
    /// report; store-level hiccups are collected, not raised.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        info!("[RESYNC] reconciliation pass starting ({})", self.mode);

        // 1. Broker holdings are authoritative.
        let balance = self.broker.get_account_balance().await?;
        let broker_holdings: HashMap<String, Holding> = balance
            .holdings
            .into_iter()
            .filter(|h| h.quantity > 0)
            .map(|h| (h.stock_code.clone(), h))
            .collect();

        // 2. File cache and 3. store rows.
        let file_positions: HashMap<String, Position> = self
            .file
            .load()
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();
        let store_positions: HashMap<String, Position> = self
            .positions()
            .get_open()
            .await?
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut report = ReconcileReport::default();
        let symbols: BTreeSet<String> = broker_holdings
            .keys()
            .chain(file_positions.keys())
            .chain(store_positions.keys())
            .cloned()
            .collect();

        let mut repaired: Vec<Position> = Vec::new();

        for symbol in symbols {
            let broker_row = broker_holdings.get(&symbol);
            let local = store_positions
                .get(&symbol)
                .or_else(|| file_positions.get(&symbol));

            match (local, broker_row) {
                (None, None) => {}
                (None, Some(holding)) => {
                    self.adopt_untracked(holding, &mut report).await;
                    if let Some(adopted) = self.load_open(&symbol).await {
                        repaired.push(adopted);
                    }
                }
                (Some(position), None) => {
                    self.clear_missing(position, &mut report).await;
                }
                (Some(position), Some(holding)) => {
                    let mut current = position.clone();
                    if position.quantity == holding.quantity {
                        // Quantities agree: adopt the broker's average
                        // price; everything frozen at entry stays frozen.
                        current.entry_price = holding.avg_price;
                        self.soft_adopt(&current, holding, &mut report).await;
                        report.matched.push(symbol.clone());
                        info!("[RESYNC] {} matched ({} shares)", symbol, holding.quantity);
                    } else {
                        // Take only the broker's quantity; entry price,
                        // ATR, stop and take-profit stay frozen.
                        current.quantity = holding.quantity;
                        self.soft_adopt(&current, holding, &mut report).await;
                        report.critical_mismatch.push(symbol.clone());
                        warn!(
                            "[RESYNC] CRITICAL_MISMATCH {}: local qty {} vs broker qty {}",
                            symbol, position.quantity, holding.quantity
                        );
                    }
                    repaired.push(current);
                }
            }
        }

        // File mirror reflects the repaired view of open positions.
        if let Err(e) = self.file.save(&repaired) {
            report
                .soft_failures
                .push(format!("position file save failed: {}", e));
            warn!("[RESYNC] position file save failed: {}", e);
        }

        self.notify_verdicts(&report);
        info!(
            "[RESYNC] pass complete: {} matched, {} untracked, {} missing, {} mismatched, {} soft failures",
            report.matched.len(),
            report.untracked.len(),
            report.recovered_missing.len(),
            report.critical_mismatch.len(),
            report.soft_failures.len()
        );
        Ok(report)
    }

    async fn load_open(&self, symbol: &str) -> Option<Position> {
        self.positions()
            .get(symbol)
            .await
            .ok()
            .flatten()
            .filter(|p| p.state == PositionState::Entered)
    }

    /// Case: broker holds, nothing tracked locally. Snapshot the broker
    /// values into store and file as a recovered position.
    async fn adopt_untracked(&self, holding: &Holding, report: &mut ReconcileReport) {
        let mut position = Position::entered(
            &holding.stock_code,
            self.mode,
            holding.avg_price,
            holding.quantity,
            0.0,
            0.0,
            f64::MAX,
            Utc::now(),
        );
        position.stock_name = Some(holding.stock_name.clone());
        position.highest_price = holding.current_price.max(holding.avg_price);

        if let Err(e) = self.positions().upsert(&position).await {
            report
                .soft_failures
                .push(format!("{}: adopt upsert failed: {}", holding.stock_code, e));
            warn!("[RESYNC] adopt upsert failed for {}: {}", holding.stock_code, e);
        }
        if let Err(e) = self
            .refresh_symbol_name(&holding.stock_code, &holding.stock_name)
            .await
        {
            report.soft_failures.push(e);
        }
        report.untracked.push(holding.stock_code.clone());
        warn!(
            "[RESYNC] UNTRACKED_HOLDING {}: {} shares @ {:.0}",
            holding.stock_code, holding.quantity, holding.avg_price
        );
    }

    /// Case: tracked locally, gone at the broker. The broker wins; close
    /// the store row and drop the file entry.
    async fn clear_missing(&self, position: &Position, report: &mut ReconcileReport) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                report
                    .soft_failures
                    .push(format!("{}: connection failed: {}", position.symbol, e));
                return;
            }
        };
        let close = PositionRepository::mark_exited_tx(
            &mut conn,
            &position.symbol,
            self.mode,
            position.entry_price,
            "RECOVERED_MISSING",
            0.0,
            Utc::now(),
        )
        .await;
        if let Err(e) = close {
            // The row may only exist in the file cache.
            report
                .soft_failures
                .push(format!("{}: close failed: {}", position.symbol, e));
            warn!("[RESYNC] close failed for {}: {}", position.symbol, e);
        }
        if let Err(e) = self.file.remove_symbol(&position.symbol) {
            report
                .soft_failures
                .push(format!("{}: file clear failed: {}", position.symbol, e));
        }
        report.recovered_missing.push(position.symbol.clone());
        warn!(
            "[RESYNC] {} tracked locally but absent at broker; local state cleared",
            position.symbol
        );
    }

    /// Push the repaired row into the store; failures are soft.
    async fn soft_adopt(
        &self,
        position: &Position,
        holding: &Holding,
        report: &mut ReconcileReport,
    ) {
        if let Err(e) = self.positions().upsert(position).await {
            report
                .soft_failures
                .push(format!("{}: store adopt failed: {}", position.symbol, e));
            warn!("[RESYNC] store adopt failed for {}: {}", position.symbol, e);
        }
        if let Err(e) = self
            .refresh_symbol_name(&position.symbol, &holding.stock_name)
            .await
        {
            report.soft_failures.push(e);
        }
    }

    async fn refresh_symbol_name(&self, code: &str, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Ok(());
        }
        SymbolCacheRepository::new(self.pool.clone())
            .upsert(code, name)
            .await
            .map_err(|e| format!("{}: symbol cache refresh failed: {}", code, e))
    }

    fn notify_verdicts(&self, report: &ReconcileReport) {
        for symbol in &report.untracked {
            self.notifier.notify(
                Severity::Error,
                "reconciliation_untracked_holding",
                json!({
                    "symbol": symbol,
                    "mode": self.mode.as_str(),
                    "reason": "UNTRACKED_HOLDING",
                }),
            );
        }
        for symbol in &report.critical_mismatch {
            self.notifier.notify(
                Severity::Error,
                "reconciliation_critical_mismatch",
                json!({
                    "symbol": symbol,
                    "mode": self.mode.as_str(),
                    "reason": "CRITICAL_MISMATCH",
                }),
            );
        }
        for symbol in &report.recovered_missing {
            self.notifier.notify(
                Severity::Warning,
                "reconciliation_recovered_missing",
                json!({
                    "symbol": symbol,
                    "mode": self.mode.as_str(),
                    "reason": "RECOVERED_MISSING",
                }),
            );
        }
        for failure in &report.soft_failures {
            self.notifier.notify(
                Severity::Warning,
                "reconciliation_soft_failure",
                json!({ "mode": self.mode.as_str(), "detail": failure }),
            );
        }
    }
}
