use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::trade::ExitReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    /// Buy submitted, fill not yet confirmed.
    Pending,
    /// Holding; exit conditions are being watched.
    Entered,
    /// Closed. Rows are retained for history, never deleted.
    Exited,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Pending => "PENDING",
            PositionState::Entered => "ENTERED",
            PositionState::Exited => "EXITED",
        }
    }
}

impl std::str::FromStr for PositionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PositionState::Pending),
            "ENTERED" => Ok(PositionState::Entered),
            "EXITED" => Ok(PositionState::Exited),
            other => Err(format!("unknown position state: {}", other)),
        }
    }
}

/// A multi-day long position. `atr_at_entry` is frozen when the entry fill
/// is confirmed and is never recomputed afterwards; stops and the trailing
/// stop are always derived from this frozen value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub mode: TradingMode,
    pub stock_name: Option<String>,
    pub entry_price: f64,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    pub atr_at_entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// 0.0 while unarmed. Monotonically non-decreasing once armed.
    pub trailing_stop: f64,
    pub highest_price: f64,
    pub state: PositionState,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub exit_time: Option<DateTime<Utc>>,
    pub realized_pnl: Option<f64>,
}

impl Position {
    pub fn entered(
        symbol: &str,
        mode: TradingMode,
        entry_price: f64,
        quantity: i64,
        atr_at_entry: f64,
        stop_loss: f64,
        take_profit: f64,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Position {
            symbol: symbol.to_string(),
            mode,
            stock_name: None,
            entry_price,
            quantity,
            entry_time,
            atr_at_entry,
            stop_loss,
            take_profit,
            trailing_stop: 0.0,
            highest_price: entry_price,
            state: PositionState::Entered,
            exit_price: None,
            exit_reason: None,
            exit_time: None,
            realized_pnl: None,
        }
    }

    /// Long-only entry sanity: stop below entry, take-profit above.
    pub fn validate_levels(entry: f64, stop: f64, take: f64) -> Result<(), String> {
        if !(stop < entry && entry < take) {
            return Err(format!(
                "invalid levels: stop {:.0} < entry {:.0} < take {:.0} must hold",
                stop, entry, take
            ));
        }
        Ok(())
    }

    pub fn pnl(&self, current_price: f64) -> (f64, f64) {
        let pnl = (current_price - self.entry_price) * self.quantity as f64;
        let pct = if self.entry_price > 0.0 {
            (current_price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        };
        (pnl, pct)
    }

    /// Track a new price observation. Highest-seen never decreases and never
    /// drops below the entry price.
    pub fn observe_price(&mut self, price: f64) {
        if price > self.highest_price {
            self.highest_price = price;
        }
    }

    /// The stop that actually applies: the trailing stop once it has climbed
    /// above the initial ATR stop.
    pub fn effective_stop(&self) -> f64 {
        self.stop_loss.max(self.trailing_stop)
    }

    /// Advance the trailing stop from the highest seen price using the
    /// entry-era ATR. Arms only after the position is up at least
    /// `activation_pct` percent; never moves down. Returns the new level
    /// when it advanced.
    pub fn advance_trailing(&mut self, atr_multiplier: f64, activation_pct: f64) -> Option<f64> {
        let gain_pct = if self.entry_price > 0.0 {
            (self.highest_price - self.entry_price) / self.entry_price * 100.0
        } else {
            0.0
        };
        if gain_pct < activation_pct {
            return None;
        }
        let candidate = self.highest_price - atr_multiplier * self.atr_at_entry;
        if candidate > self.trailing_stop {
            self.trailing_stop = candidate;
            return Some(candidate);
        }
        None
    }

    /// Distance to the effective stop in units of the entry-era ATR. `None`
    /// when the ATR is degenerate.
    pub fn stop_distance_in_atr(&self, current_price: f64) -> Option<f64> {
        if self.atr_at_entry <= 0.0 {
            return None;
        }
        Some((current_price - self.effective_stop()) / self.atr_at_entry)
    }

    /// Whether the fast polling cadence should apply: the price sits within
    /// `band` ATRs of the effective stop.
    pub fn is_near_stop(&self, current_price: f64, band: f64) -> bool {
        match self.stop_distance_in_atr(current_price) {
            Some(d) => d <= band,
            None => false,
        }
    }

    pub fn close(&mut self, exit_price: f64, reason: ExitReason, exit_time: DateTime<Utc>) {
        let (pnl, _) = self.pnl(exit_price);
        self.state = PositionState::Exited;
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason);
        self.exit_time = Some(exit_time);
        self.realized_pnl = Some(pnl);
    }

    pub fn holding_days(&self, now: DateTime<Utc>) -> i64 {
        (now.date_naive() - self.entry_time.date_naive()).num_days() + 1
    }
}
