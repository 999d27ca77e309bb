//! Multi-day execution loop.
//!
//! One loop per process. Each cycle walks holdings plus entry candidates:
//! quote, gap check, strategy signal, trailing-stop advance, risk gate,
//! synchronizer dispatch, snapshot. Cadence is dynamic: the loop drops to
//! the fast interval while any open position sits inside the near-stop
//! band. Exits are never forced by the clock; only price conditions and
//! the gap guard close positions.

use crate::application::engine::reconciler::{PositionReconciler, ReconcileReport};
use crate::application::engine::synchronizer::{BuyDecision, OrderSynchronizer, SellDecision};
use crate::application::universe::UniverseService;
use crate::config::AppConfig;
use crate::domain::entities::position::{Position, PositionState};
use crate::domain::entities::trade::ExitReason;
use crate::domain::errors::EngineError;
use crate::domain::repositories::broker::Broker;
use crate::domain::repositories::notifier::{Notifier, Severity};
use crate::domain::services::gap_guard::evaluate_gap;
use crate::domain::services::market_hours::now_kst;
use crate::domain::services::risk_controller::{RiskController, RiskDenyCode};
use crate::domain::services::strategy::{Signal, Strategy};
use crate::persistence::position_file::PositionFileStore;
use crate::persistence::repository::{
    AccountSnapshotRepository, DailySummaryRepository, OrderStateRepository, PositionRepository,
};
use crate::persistence::DbPool;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const OUTAGE_POLL_INTERVAL: Duration = Duration::from_secs(15);
const SNAPSHOT_MIN_SPACING: Duration = Duration::from_secs(60);

pub struct TradingEngine {
    cfg: AppConfig,
    broker: Arc<dyn Broker>,
    strategy: Arc<dyn Strategy>,
    notifier: Arc<dyn Notifier>,
    pool: DbPool,
    synchronizer: Arc<OrderSynchronizer>,
    reconciler: PositionReconciler,
    universe: UniverseService,
    risk: RiskController,
    file: PositionFileStore,
    initial_equity: f64,
    universe_date: Option<NaiveDate>,
    todays_universe: Vec<String>,
    last_snapshot_at: Option<DateTime<Utc>>,
    in_outage: bool,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        broker: Arc<dyn Broker>,
        strategy: Arc<dyn Strategy>,
        notifier: Arc<dyn Notifier>,
        pool: DbPool,
        initial_equity: f64,
    ) -> Self {
        let synchronizer = Arc::new(OrderSynchronizer::new(
            broker.clone(),
            pool.clone(),
            cfg.mode,
            notifier.clone(),
            cfg.order_execution_timeout,
            cfg.pending_exit_backoff,
        ));
        let reconciler = PositionReconciler::new(
            broker.clone(),
            pool.clone(),
            PositionFileStore::new(cfg.positions_file(), cfg.mode),
            cfg.mode,
            notifier.clone(),
        );
        let universe = UniverseService::new(
            broker.clone(),
            crate::persistence::universe_cache::UniverseCacheFile::new(cfg.universe_cache_file()),
            cfg.universe.clone(),
            cfg.mode,
        );
        let risk = RiskController::new(cfg.risk.clone(), initial_equity, now_kst().date_naive());
        let file = PositionFileStore::new(cfg.positions_file(), cfg.mode);
        TradingEngine {
            broker,
            strategy,
            notifier,
            pool,
            synchronizer,
            reconciler,
            universe,
            risk,
            file,
            initial_equity,
            universe_date: None,
            todays_universe: Vec::new(),
            last_snapshot_at: None,
            in_outage: false,
            cfg,
        }
    }

    fn positions(&self) -> PositionRepository {
        PositionRepository::new(self.pool.clone(), self.cfg.mode)
    }

    fn orders(&self) -> OrderStateRepository {
        OrderStateRepository::new(self.pool.clone(), self.cfg.mode)
    }

    /// Startup sequence: reconcile against the broker, cancel abandoned
    /// order rows, resume in-flight orders left by a previous process.
    pub async fn startup(&mut self) -> Result<ReconcileReport, EngineError> {
        let report = self.reconciler.reconcile().await?;
        self.synchronizer.cleanup_stale_orders().await?;
        let resumed = self.synchronizer.resume_open_orders().await?;
        if resumed > 0 {
            info!("[ENGINE] resumed {} in-flight orders", resumed);
        }
        Ok(report)
    }

    /// Main loop. Runs until `max_runs` cycles complete or shutdown is
    /// signalled; the in-flight cycle always completes before exit.
    pub async fn run(
        &mut self,
        max_runs: Option<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(
            "[ENGINE] loop starting: mode={} interval={:?} fast={:?}",
            self.cfg.mode, self.cfg.interval, self.cfg.near_stop_interval
        );
        let mut runs: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.broker.is_network_outage() {
                if !self.in_outage {
                    warn!("[ENGINE] network outage detected; cycles suspended");
                    self.in_outage = true;
                }
                tokio::select! {
                    _ = tokio::time::sleep(OUTAGE_POLL_INTERVAL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            if self.in_outage {
                self.in_outage = false;
                info!("[ENGINE] network recovered; reconciling before next cycle");
                if let Err(e) = self.reconciler.reconcile().await {
                    warn!("[ENGINE] post-outage reconciliation failed: {}", e);
                    continue;
                }
            }

            let near_stop = match self.run_cycle().await {
                Ok(near) => near,
                Err(EngineError::UniverseHalted(msg)) => {
                    return Err(EngineError::UniverseHalted(msg));
                }
                Err(e) => {
                    error!("[ENGINE] cycle failed: {}", e);
                    self.notifier.notify(
                        Severity::Error,
                        "system_loop_error",
                        json!({ "mode": self.cfg.mode.as_str(), "reason": e.to_string() }),
                    );
                    false
                }
            };

            runs += 1;
            // Periodic hygiene on top of the startup pass.
            if runs % 60 == 0 {
                if let Err(e) = self.synchronizer.cleanup_stale_orders().await {
                    warn!("[ENGINE] stale order cleanup failed: {}", e);
                }
            }
            if let Some(max) = max_runs {
                if runs >= max {
                    info!("[ENGINE] reached max runs: {}", max);
                    break;
                }
            }

            let delay = if near_stop {
                self.cfg.near_stop_interval
            } else {
                self.cfg.interval
            };
            debug!("[ENGINE] sleeping {:?} (near_stop={})", delay, near_stop);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.flush_on_shutdown().await;
        Ok(())
    }

    /// One full pass over holdings and candidates. Returns whether any open
    /// position is inside the near-stop band.
    async fn run_cycle(&mut self) -> Result<bool, EngineError> {
        let today = now_kst().date_naive();

        let open_positions = self.positions().get_open().await?;
        let holdings: Vec<String> = open_positions.iter().map(|p| p.symbol.clone()).collect();

        if self.universe_date != Some(today) {
            let universe = self.universe.todays_universe(today, &holdings).await?;
            self.todays_universe = universe;
            self.universe_date = Some(today);
        }

        self.retry_pending_exits(&open_positions).await;

        // SELLs are always evaluated for all holdings; BUY candidates only
        // while there is capacity.
        let mut symbols: Vec<(String, bool)> =
            holdings.iter().map(|s| (s.clone(), true)).collect();
        if holdings.len() < self.cfg.max_positions {
            for symbol in UniverseService::entry_candidates(&self.todays_universe, &holdings) {
                symbols.push((symbol, false));
            }
        }

        let mut near_stop = false;
        for (symbol, is_holding) in symbols {
            if self.broker.is_network_outage() {
                warn!("[ENGINE] outage mid-cycle; aborting remaining symbols");
                break;
            }
            match self.process_symbol(&symbol, is_holding).await {
                Ok(near) => near_stop |= near,
                Err(e) => {
                    // One symbol's failure must not stop the others.
                    warn!("[ENGINE] {} cycle error: {}", symbol, e);
                }
            }
        }

        self.maybe_snapshot().await;
        self.mirror_positions_to_file().await;
        Ok(near_stop)
    }

    async fn process_symbol(&mut self, symbol: &str, is_holding: bool) -> Result<bool, EngineError> {
        let quote = self.broker.get_current_price(symbol).await?;
        let bars = self.broker.get_daily_ohlcv(symbol, 80).await?;
        let position = self
            .positions()
            .get(symbol)
            .await?
            .filter(|p| p.state == PositionState::Entered);

        let Some(mut position) = position else {
            if !is_holding {
                self.consider_entry(symbol, &bars, quote.current_price).await?;
            }
            return Ok(false);
        };

        // Gap protection runs against the persisted entry reference before
        // any strategy evaluation.
        let gap = evaluate_gap(
            quote.open_price,
            position.entry_price,
            self.cfg.gap_threshold_pct,
            self.cfg.gap_epsilon_pct,
        );
        if gap.triggered() {
            info!(
                "[GAP] {} open {:.0} vs reference {:.0}: raw {:.2}% (display {:.2}%)",
                symbol,
                quote.open_price,
                position.entry_price,
                gap.raw_gap_pct,
                gap.raw_gap_pct.abs()
            );
            self.notifier.notify(
                Severity::Info,
                "gap_protection_triggered",
                json!({
                    "symbol": symbol,
                    "mode": self.cfg.mode.as_str(),
                    "raw_gap_pct": gap.raw_gap_pct,
                    "display_gap_pct": gap.raw_gap_pct.abs(),
                    "reference_price": position.entry_price,
                    "open_price": quote.open_price,
                }),
            );
            self.try_exit(&position, quote.current_price, ExitReason::GapProtection)
                .await?;
            return Ok(false);
        }

        position.observe_price(quote.current_price);
        if let Some(new_trail) = position.advance_trailing(
            self.cfg.trailing_atr_multiplier,
            self.cfg.trailing_activation_pct,
        ) {
            info!(
                "[TRAIL] {} trailing stop advanced to {:.0} (high {:.0})",
                symbol, new_trail, position.highest_price
            );
        }
        let (unrealized, _) = position.pnl(quote.current_price);
        self.positions()
            .update_marks(
                symbol,
                quote.current_price,
                unrealized,
                position.highest_price,
                position.trailing_stop,
            )
            .await?;

        let decision = self
            .strategy
            .evaluate(symbol, Some(&position), &bars, quote.current_price);
        if decision.signal == Signal::Sell {
            let reason = decision.exit_reason.unwrap_or(ExitReason::Manual);
            info!("[ENGINE] {} SELL signal: {}", symbol, decision.reason);
            self.try_exit(&position, quote.current_price, reason).await?;
            return Ok(false);
        }

        Ok(position.is_near_stop(quote.current_price, self.cfg.near_stop_band_atr))
    }

    async fn consider_entry(
        &mut self,
        symbol: &str,
        bars: &[crate::domain::entities::candle::DailyBar],
        current_price: f64,
    ) -> Result<(), EngineError> {
        let decision = self.strategy.evaluate(symbol, None, bars, current_price);
        if decision.signal != Signal::Buy {
            return Ok(());
        }
        info!("[ENGINE] {} BUY signal: {}", symbol, decision.reason);

        // Re-check capacity at decision time; earlier entries in this same
        // cycle count against it.
        let open_count = self.positions().get_open().await?.len();
        if open_count >= self.cfg.max_positions {
            info!("[ENGINE] {} entry skipped: position capacity reached", symbol);
            return Ok(());
        }

        let equity = self.current_equity().await;
        if let Err(denied) = self.risk.check_entry(now_kst(), equity) {
            info!("[RISK] entry denied for {}: {}", symbol, denied.reason);
            if denied.code == RiskDenyCode::CumulativeDrawdown {
                self.notifier.notify(
                    Severity::Error,
                    "cumulative_drawdown_kill",
                    json!({
                        "mode": self.cfg.mode.as_str(),
                        "reason": denied.reason,
                    }),
                );
            }
            return Ok(());
        }

        let (Some(stop), Some(take), Some(atr)) = (
            decision.suggested_stop,
            decision.suggested_take_profit,
            decision.atr_at_entry,
        ) else {
            warn!("[ENGINE] {} BUY signal without levels; ignored", symbol);
            return Ok(());
        };
        if Position::validate_levels(decision.reference_price, stop, take).is_err() {
            warn!("[ENGINE] {} BUY signal with degenerate levels; ignored", symbol);
            return Ok(());
        }

        let today = now_kst().date_naive();
        let attempts = self
            .orders()
            .terminal_count_for_day(symbol, "BUY", today)
            .await?;
        let buy = BuyDecision {
            symbol: symbol.to_string(),
            qty: self.cfg.order_quantity,
            signal_id: format!("entry-{}-r{}", today.format("%Y%m%d"), attempts),
            reference_price: decision.reference_price,
            stop_loss: stop,
            take_profit: take,
            atr_at_entry: atr,
            stock_name: None,
        };
        let result = self.synchronizer.execute_buy(&buy).await?;
        if result.filled_qty > 0 {
            self.risk.record_entry(today);
            self.notifier.notify(
                Severity::Info,
                "position_opened",
                json!({
                    "symbol": symbol,
                    "mode": self.cfg.mode.as_str(),
                    "qty": result.filled_qty,
                    "price": result.avg_price,
                    "stop_loss": stop,
                    "take_profit": take,
                }),
            );
        }
        Ok(())
    }

    /// Route an exit decision through the risk gate. Session denials defer
    /// the exit (pending-exit) instead of dropping it.
    async fn try_exit(
        &mut self,
        position: &Position,
        current_price: f64,
        reason: ExitReason,
    ) -> Result<(), EngineError> {
        if let Err(denied) = self.risk.check_exit(now_kst()) {
            self.synchronizer
                .register_pending_exit(&position.symbol, reason, &denied.reason);
            return Ok(());
        }

        let today = now_kst().date_naive();
        let attempts = self
            .orders()
            .terminal_count_for_day(&position.symbol, "SELL", today)
            .await?;
        let decision = SellDecision {
            symbol: position.symbol.clone(),
            qty: position.quantity,
            signal_id: format!(
                "{}-{}-r{}",
                reason.as_str().to_lowercase(),
                today.format("%Y%m%d"),
                attempts
            ),
            reference_price: current_price,
            reason,
        };
        let result = self.synchronizer.execute_sell(&decision).await?;
        if result.filled_qty > 0 {
            let pnl = (result.avg_price - position.entry_price) * result.filled_qty as f64;
            let pnl_pct = if position.entry_price > 0.0 {
                (result.avg_price - position.entry_price) / position.entry_price * 100.0
            } else {
                0.0
            };
            self.risk.record_closed_trade(pnl, pnl_pct, today);
            if let Err(e) = DailySummaryRepository::new(self.pool.clone(), self.cfg.mode)
                .record_closed_trade(today, pnl)
                .await
            {
                warn!("[ENGINE] daily summary update failed: {}", e);
            }
            self.notifier.notify(
                Severity::Info,
                "position_closed",
                json!({
                    "symbol": position.symbol,
                    "mode": self.cfg.mode.as_str(),
                    "qty": result.filled_qty,
                    "price": result.avg_price,
                    "reason": reason.as_str(),
                    "pnl": pnl,
                    "pnl_pct": pnl_pct,
                }),
            );
        }
        Ok(())
    }

    async fn retry_pending_exits(&mut self, open_positions: &[Position]) {
        for (symbol, reason) in self.synchronizer.due_pending_exits(Utc::now()) {
            let Some(position) = open_positions.iter().find(|p| p.symbol == symbol) else {
                continue;
            };
            let Ok(quote) = self.broker.get_current_price(&symbol).await else {
                continue;
            };
            if let Err(e) = self.try_exit(position, quote.current_price, reason).await {
                warn!("[ENGINE] pending exit retry failed for {}: {}", symbol, e);
            }
        }
    }

    async fn current_equity(&self) -> f64 {
        match self.broker.get_account_balance().await {
            Ok(balance) if balance.total_equity > 0.0 => balance.total_equity,
            _ => self.initial_equity,
        }
    }

    /// Persist an account snapshot at most once per minute.
    async fn maybe_snapshot(&mut self) {
        let now = Utc::now();
        if let Some(last) = self.last_snapshot_at {
            if (now - last).to_std().map(|d| d < SNAPSHOT_MIN_SPACING).unwrap_or(true) {
                return;
            }
        }
        let Ok(balance) = self.broker.get_account_balance().await else {
            return;
        };
        let open = self.positions().get_open().await.unwrap_or_default();
        let repo = AccountSnapshotRepository::new(self.pool.clone(), self.cfg.mode);
        if let Err(e) = repo
            .insert(
                now,
                balance.total_equity,
                balance.cash,
                balance.total_pnl,
                self.risk.daily_realized_pnl(),
                open.len() as i64,
            )
            .await
        {
            warn!("[ENGINE] snapshot insert failed: {}", e);
        } else {
            self.last_snapshot_at = Some(now);
        }
    }

    async fn mirror_positions_to_file(&self) {
        match self.positions().get_open().await {
            Ok(open) => {
                if let Err(e) = self.file.save(&open) {
                    warn!("[ENGINE] position file mirror failed: {}", e);
                }
            }
            Err(e) => warn!("[ENGINE] position read for mirror failed: {}", e),
        }
    }

    /// Shutdown: finish the decision boundary, persist a final snapshot
    /// and the position file, then return so the lock can be released.
    async fn flush_on_shutdown(&mut self) {
        info!("[ENGINE] shutting down; persisting final state");
        self.mirror_positions_to_file().await;
        self.last_snapshot_at = None;
        self.maybe_snapshot().await;
        self.notifier.notify(
            Severity::Info,
            "system_stopped",
            json!({
                "mode": self.cfg.mode.as_str(),
                "daily_realized_pnl": self.risk.daily_realized_pnl(),
                "daily_trades": self.risk.daily_trades_count(),
            }),
        );
    }
}
