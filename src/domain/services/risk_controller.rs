//! Order gating.
//!
//! Every order passes through here before it reaches the synchronizer.
//! Checks run in a fixed order and the first failure denies. The checks
//! read a snapshot taken once per cycle; any race between check and submit
//! is absorbed downstream by the synchronizer's idempotency key.

use crate::domain::services::market_hours::{self, SessionDenial};
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Daily realized-loss cap as % of starting equity. Entries blocked on
    /// breach; exits always allowed.
    pub daily_max_loss_pct: f64,
    /// Last closed trade's loss (% of entry) beyond which re-entries are
    /// blocked for the day.
    pub per_trade_max_loss_pct: f64,
    /// Cumulative drawdown cap against initial equity. Breach engages the
    /// kill-switch persistently.
    pub cumulative_dd_pct: f64,
    pub max_consecutive_losses: u32,
    pub daily_max_trades: u32,
    pub kill_switch_path: PathBuf,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            daily_max_loss_pct: 3.0,
            per_trade_max_loss_pct: 5.0,
            cumulative_dd_pct: 15.0,
            max_consecutive_losses: 3,
            daily_max_trades: 10,
            kill_switch_path: PathBuf::from("data/KILL_SWITCH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDenyCode {
    KillSwitch,
    Session(SessionDenial),
    PerTradeLoss,
    DailyLoss,
    ConsecutiveLosses,
    TradeCount,
    CumulativeDrawdown,
}

#[derive(Debug, Clone)]
pub struct RiskDenied {
    pub code: RiskDenyCode,
    pub reason: String,
}

/// Per-trading-day realized pnl tracking. Resets when the KST date rolls.
#[derive(Debug, Clone)]
struct DailyTracker {
    date: NaiveDate,
    starting_equity: f64,
    realized_pnl: f64,
    trades_count: u32,
    consecutive_losses: u32,
    last_closed_pnl_pct: Option<f64>,
}

impl DailyTracker {
    fn new(date: NaiveDate, starting_equity: f64) -> Self {
        DailyTracker {
            date,
            starting_equity,
            realized_pnl: 0.0,
            trades_count: 0,
            consecutive_losses: 0,
            last_closed_pnl_pct: None,
        }
    }

    fn loss_pct(&self) -> f64 {
        if self.starting_equity <= 0.0 {
            return 0.0;
        }
        self.realized_pnl / self.starting_equity * 100.0
    }
}

pub struct RiskController {
    cfg: RiskConfig,
    tracker: DailyTracker,
    initial_equity: f64,
}

impl RiskController {
    pub fn new(cfg: RiskConfig, initial_equity: f64, today: NaiveDate) -> Self {
        RiskController {
            cfg,
            tracker: DailyTracker::new(today, initial_equity),
            initial_equity,
        }
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.cfg.kill_switch_path.exists()
    }

    pub fn kill_switch_path(&self) -> &Path {
        &self.cfg.kill_switch_path
    }

    /// Persistently engage the kill-switch. Reconciliation reads stay
    /// allowed; only new orders are denied.
    pub fn engage_kill_switch(&self, reason: &str) {
        if let Some(parent) = self.cfg.kill_switch_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.cfg.kill_switch_path, reason) {
            warn!("[RISK] failed to write kill-switch file: {}", e);
        } else {
            warn!("[RISK] kill-switch engaged: {}", reason);
        }
    }

    fn roll_day_if_needed(&mut self, today: NaiveDate, current_equity: f64) {
        if self.tracker.date != today {
            info!(
                "[RISK] new trading day {} (previous realized {:+.0})",
                today, self.tracker.realized_pnl
            );
            self.tracker = DailyTracker::new(today, current_equity);
        }
    }

    /// Record a closed trade's realized pnl. Keeps the daily counters and
    /// the consecutive-loss streak current.
    pub fn record_closed_trade(&mut self, pnl: f64, pnl_pct: f64, today: NaiveDate) {
        self.roll_day_if_needed(today, self.tracker.starting_equity);
        self.tracker.realized_pnl += pnl;
        self.tracker.trades_count += 1;
        self.tracker.last_closed_pnl_pct = Some(pnl_pct);
        if pnl < 0.0 {
            self.tracker.consecutive_losses += 1;
        } else {
            self.tracker.consecutive_losses = 0;
        }
        info!(
            "[RISK] trade recorded: {:+.0} ({:+.2}%) | day total {:+.0} ({:+.2}%), streak {}",
            pnl,
            pnl_pct,
            self.tracker.realized_pnl,
            self.tracker.loss_pct(),
            self.tracker.consecutive_losses
        );
    }

    /// Count an entry fill toward the daily trade cap.
    pub fn record_entry(&mut self, today: NaiveDate) {
        self.roll_day_if_needed(today, self.tracker.starting_equity);
        self.tracker.trades_count += 1;
    }

    /// Manual reset of the per-day limits (operator action).
    pub fn reset_daily_limits(&mut self, today: NaiveDate, starting_equity: f64) {
        warn!("[RISK] daily limits manually reset");
        self.tracker = DailyTracker::new(today, starting_equity);
    }

    /// Gate a new entry. Checks in order; first failure denies.
    pub fn check_entry(
        &mut self,
        now: DateTime<FixedOffset>,
        current_equity: f64,
    ) -> Result<(), RiskDenied> {
        self.roll_day_if_needed(now.date_naive(), current_equity);

        if self.kill_switch_engaged() {
            return Err(RiskDenied {
                code: RiskDenyCode::KillSwitch,
                reason: "kill-switch file present; all new orders denied".into(),
            });
        }

        if let Err(denial) = market_hours::entry_allowed(now) {
            return Err(RiskDenied {
                code: RiskDenyCode::Session(denial),
                reason: format!("entries not allowed: {}", denial.as_str()),
            });
        }

        if let Some(last_pct) = self.tracker.last_closed_pnl_pct {
            if last_pct <= -self.cfg.per_trade_max_loss_pct {
                return Err(RiskDenied {
                    code: RiskDenyCode::PerTradeLoss,
                    reason: format!(
                        "last closed trade lost {:.2}% (cap {:.2}%); re-entry blocked",
                        last_pct, self.cfg.per_trade_max_loss_pct
                    ),
                });
            }
        }

        if self.tracker.loss_pct() <= -self.cfg.daily_max_loss_pct {
            return Err(RiskDenied {
                code: RiskDenyCode::DailyLoss,
                reason: format!(
                    "daily loss {:.2}% breached cap {:.2}%; entries halted",
                    self.tracker.loss_pct(),
                    self.cfg.daily_max_loss_pct
                ),
            });
        }

        if self.cfg.max_consecutive_losses > 0
            && self.tracker.consecutive_losses >= self.cfg.max_consecutive_losses
        {
            return Err(RiskDenied {
                code: RiskDenyCode::ConsecutiveLosses,
                reason: format!(
                    "{} consecutive losing trades (cap {})",
                    self.tracker.consecutive_losses, self.cfg.max_consecutive_losses
                ),
            });
        }

        if self.cfg.daily_max_trades > 0 && self.tracker.trades_count >= self.cfg.daily_max_trades {
            return Err(RiskDenied {
                code: RiskDenyCode::TradeCount,
                reason: format!(
                    "daily trade count {} reached cap {}",
                    self.tracker.trades_count, self.cfg.daily_max_trades
                ),
            });
        }

        if self.initial_equity > 0.0 {
            let dd = (self.initial_equity - current_equity) / self.initial_equity * 100.0;
            if dd >= self.cfg.cumulative_dd_pct {
                self.engage_kill_switch(&format!(
                    "cumulative drawdown {:.2}% >= cap {:.2}%",
                    dd, self.cfg.cumulative_dd_pct
                ));
                return Err(RiskDenied {
                    code: RiskDenyCode::CumulativeDrawdown,
                    reason: format!(
                        "cumulative drawdown {:.2}% breached cap {:.2}%; kill-switch engaged",
                        dd, self.cfg.cumulative_dd_pct
                    ),
                });
            }
        }

        Ok(())
    }

    /// Gate an exit. Exits stay allowed under the loss caps and under an
    /// engaged kill-switch; only the session clock can defer them.
    pub fn check_exit(&mut self, now: DateTime<FixedOffset>) -> Result<(), RiskDenied> {
        if let Err(denial) = market_hours::exit_allowed(now) {
            return Err(RiskDenied {
                code: RiskDenyCode::Session(denial),
                reason: format!("exits not allowed: {}", denial.as_str()),
            });
        }
        Ok(())
    }

    pub fn daily_realized_pnl(&self) -> f64 {
        self.tracker.realized_pnl
    }

    pub fn daily_trades_count(&self) -> u32 {
        self.tracker.trades_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn open_session() -> DateTime<FixedOffset> {
        crate::domain::services::market_hours::kst()
            .with_ymd_and_hms(2026, 7, 31, 10, 0, 0)
            .unwrap()
    }

    fn controller(dir: &tempfile::TempDir) -> RiskController {
        let cfg = RiskConfig {
            daily_max_loss_pct: 3.0,
            per_trade_max_loss_pct: 5.0,
            cumulative_dd_pct: 15.0,
            max_consecutive_losses: 2,
            daily_max_trades: 4,
            kill_switch_path: dir.path().join("KILL_SWITCH"),
        };
        RiskController::new(cfg, 10_000_000.0, open_session().date_naive())
    }

    #[test]
    fn test_per_trade_loss_blocks_reentry_not_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        risk.record_closed_trade(-600_000.0, -6.0, open_session().date_naive());

        let denied = risk.check_entry(open_session(), 9_400_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::PerTradeLoss);

        assert!(risk.check_exit(open_session()).is_ok());
    }

    #[test]
    fn test_daily_loss_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        // Two losses summing past 3% of 10M; each stays under the 5%
        // per-trade cap so the daily cap is the first rule to fire.
        risk.record_closed_trade(-200_000.0, -2.0, open_session().date_naive());
        risk.record_closed_trade(-150_000.0, -1.5, open_session().date_naive());

        let denied = risk.check_entry(open_session(), 9_650_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::DailyLoss);
    }

    #[test]
    fn test_consecutive_loss_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        // Two small losses: daily total -2% stays inside the 3% cap, so
        // the streak rule is the one that fires.
        risk.record_closed_trade(-100_000.0, -1.0, open_session().date_naive());
        risk.record_closed_trade(-100_000.0, -1.0, open_session().date_naive());

        let denied = risk.check_entry(open_session(), 9_800_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::ConsecutiveLosses);

        // A winning trade clears the streak.
        risk.record_closed_trade(50_000.0, 0.5, open_session().date_naive());
        assert!(risk.check_entry(open_session(), 9_850_000.0).is_ok());
    }

    #[test]
    fn test_trade_count_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        for _ in 0..4 {
            risk.record_closed_trade(5_000.0, 0.1, open_session().date_naive());
        }
        let denied = risk.check_entry(open_session(), 10_000_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::TradeCount);
    }

    #[test]
    fn test_cumulative_drawdown_engages_kill_switch() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        // 10,000,000 -> 8,490,000 is a 15.1% drawdown.
        let denied = risk.check_entry(open_session(), 8_490_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::CumulativeDrawdown);
        assert!(risk.kill_switch_engaged());

        // Once engaged, every further entry is denied up front.
        let denied = risk.check_entry(open_session(), 9_900_000.0).unwrap_err();
        assert_eq!(denied.code, RiskDenyCode::KillSwitch);
        // Exits still pass.
        assert!(risk.check_exit(open_session()).is_ok());
    }

    #[test]
    fn test_session_gate_in_entry_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        let auction = crate::domain::services::market_hours::kst()
            .with_ymd_and_hms(2026, 7, 31, 15, 25, 0)
            .unwrap();
        let denied = risk.check_entry(auction, 10_000_000.0).unwrap_err();
        assert_eq!(
            denied.code,
            RiskDenyCode::Session(SessionDenial::CallAuction)
        );
    }

    #[test]
    fn test_day_roll_resets_counters() {
        let dir = tempfile::tempdir().unwrap();
        let mut risk = controller(&dir);
        risk.record_closed_trade(-200_000.0, -2.0, open_session().date_naive());
        risk.record_closed_trade(-150_000.0, -1.5, open_session().date_naive());

        // Next trading day (Monday): counters reset, entry allowed again.
        let monday = crate::domain::services::market_hours::kst()
            .with_ymd_and_hms(2026, 8, 3, 10, 0, 0)
            .unwrap();
        assert!(risk.check_entry(monday, 9_650_000.0).is_ok());
        assert_eq!(risk.daily_trades_count(), 0);
    }
}
