//! Strategy capability trait plus the default trend/ATR implementation.
//!
//! A strategy is a pure function of `(symbol, position, bars, price)`; it
//! performs no I/O and holds no state the caller did not pass in. The
//! engine depends only on the trait.

use crate::domain::entities::candle::DailyBar;
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ExitReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone)]
pub struct StrategyDecision {
    pub signal: Signal,
    pub reason: String,
    /// Price the decision keyed off (entry reference for buys).
    pub reference_price: f64,
    pub suggested_stop: Option<f64>,
    pub suggested_take_profit: Option<f64>,
    /// Volatility at decision time; frozen into the position at entry.
    pub atr_at_entry: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl StrategyDecision {
    pub fn hold(reference_price: f64, reason: impl Into<String>) -> Self {
        StrategyDecision {
            signal: Signal::Hold,
            reason: reason.into(),
            reference_price,
            suggested_stop: None,
            suggested_take_profit: None,
            atr_at_entry: None,
            exit_reason: None,
        }
    }

    pub fn sell(reference_price: f64, reason: impl Into<String>, exit: ExitReason) -> Self {
        StrategyDecision {
            signal: Signal::Sell,
            reason: reason.into(),
            reference_price,
            suggested_stop: None,
            suggested_take_profit: None,
            atr_at_entry: None,
            exit_reason: Some(exit),
        }
    }
}

pub trait Strategy: Send + Sync {
    fn evaluate(
        &self,
        symbol: &str,
        position: Option<&Position>,
        bars: &[DailyBar],
        current_price: f64,
    ) -> StrategyDecision;
}

/// Wilder-smoothed ATR over ascending bars. `None` until enough bars exist.
pub fn wilder_atr(bars_asc: &[DailyBar], period: usize) -> Option<f64> {
    if period == 0 || bars_asc.len() < period + 1 {
        return None;
    }
    let mut atr = 0.0;
    for i in 1..=period {
        atr += bars_asc[i].true_range(bars_asc[i - 1].close);
    }
    atr /= period as f64;
    for i in (period + 1)..bars_asc.len() {
        let tr = bars_asc[i].true_range(bars_asc[i - 1].close);
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(atr)
}

/// Simple moving average of the last `period` closes.
pub fn sma_close(bars_asc: &[DailyBar], period: usize) -> Option<f64> {
    if period == 0 || bars_asc.len() < period {
        return None;
    }
    let sum: f64 = bars_asc[bars_asc.len() - period..]
        .iter()
        .map(|b| b.close)
        .sum();
    Some(sum / period as f64)
}

#[derive(Debug, Clone)]
pub struct TrendAtrConfig {
    pub atr_period: usize,
    pub ma_period: usize,
    pub stop_multiplier: f64,
    pub take_profit_multiplier: f64,
    /// Entry refused when the current ATR exceeds this multiple of its
    /// recent average (volatility spike guard).
    pub atr_spike_threshold: f64,
}

impl Default for TrendAtrConfig {
    fn default() -> Self {
        TrendAtrConfig {
            atr_period: 14,
            ma_period: 50,
            stop_multiplier: 2.0,
            take_profit_multiplier: 3.0,
            atr_spike_threshold: 2.5,
        }
    }
}

/// Multi-day trend-following entry with ATR-derived exits. Entries require
/// price above a rising moving average and a sane ATR; exits come from the
/// frozen entry-era levels plus a trend-break check against the moving
/// average.
pub struct TrendAtrStrategy {
    cfg: TrendAtrConfig,
}

impl TrendAtrStrategy {
    pub fn new(cfg: TrendAtrConfig) -> Self {
        TrendAtrStrategy { cfg }
    }

    fn atr_is_spiked(&self, bars_asc: &[DailyBar]) -> bool {
        let period = self.cfg.atr_period;
        let Some(current) = wilder_atr(bars_asc, period) else {
            return false;
        };
        // Average ATR over a window ending one bar back.
        if bars_asc.len() < 2 * period {
            return false;
        }
        let Some(baseline) = wilder_atr(&bars_asc[..bars_asc.len() - 1], period) else {
            return false;
        };
        baseline > 0.0 && current > self.cfg.atr_spike_threshold * baseline
    }
}

impl Default for TrendAtrStrategy {
    fn default() -> Self {
        TrendAtrStrategy::new(TrendAtrConfig::default())
    }
}

impl Strategy for TrendAtrStrategy {
    fn evaluate(
        &self,
        _symbol: &str,
        position: Option<&Position>,
        bars: &[DailyBar],
        current_price: f64,
    ) -> StrategyDecision {
        if current_price <= 0.0 {
            return StrategyDecision::hold(0.0, "no quote");
        }

        // Broker delivers bars descending; indicator math runs ascending.
        let mut asc: Vec<DailyBar> = bars.to_vec();
        asc.sort_by_key(|b| b.date);

        let ma = sma_close(&asc, self.cfg.ma_period);
        let atr = wilder_atr(&asc, self.cfg.atr_period);

        if let Some(pos) = position {
            let stop = pos.effective_stop();
            if current_price <= stop {
                let exit = if pos.trailing_stop > pos.stop_loss {
                    ExitReason::TrailingStop
                } else {
                    ExitReason::AtrStop
                };
                return StrategyDecision::sell(
                    current_price,
                    format!("price {:.0} at or below stop {:.0}", current_price, stop),
                    exit,
                );
            }
            if current_price >= pos.take_profit {
                return StrategyDecision::sell(
                    current_price,
                    format!(
                        "price {:.0} reached take-profit {:.0}",
                        current_price, pos.take_profit
                    ),
                    ExitReason::TakeProfit,
                );
            }
            if let Some(ma) = ma {
                if current_price < ma {
                    return StrategyDecision::sell(
                        current_price,
                        format!("close {:.0} under MA{} {:.0}", current_price, self.cfg.ma_period, ma),
                        ExitReason::TrendBroken,
                    );
                }
            }
            return StrategyDecision::hold(current_price, "holding; exit levels intact");
        }

        // Entry path.
        let (Some(ma), Some(atr)) = (ma, atr) else {
            return StrategyDecision::hold(current_price, "insufficient history");
        };
        if atr <= 0.0 {
            return StrategyDecision::hold(current_price, "degenerate ATR");
        }
        if current_price <= ma {
            return StrategyDecision::hold(current_price, "price under trend MA");
        }
        let prev_ma = sma_close(&asc[..asc.len() - 1], self.cfg.ma_period);
        if let Some(prev) = prev_ma {
            if ma < prev {
                return StrategyDecision::hold(current_price, "trend MA falling");
            }
        }
        if self.atr_is_spiked(&asc) {
            return StrategyDecision::hold(current_price, "volatility spike; entry refused");
        }

        let stop = current_price - self.cfg.stop_multiplier * atr;
        let take = current_price + self.cfg.take_profit_multiplier * atr;
        if Position::validate_levels(current_price, stop, take).is_err() {
            return StrategyDecision::hold(current_price, "degenerate entry levels");
        }

        StrategyDecision {
            signal: Signal::Buy,
            reason: format!(
                "uptrend: price {:.0} above rising MA{} {:.0}, ATR {:.0}",
                current_price, self.cfg.ma_period, ma, atr
            ),
            reference_price: current_price,
            suggested_stop: Some(stop),
            suggested_take_profit: Some(take),
            atr_at_entry: Some(atr),
            exit_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::mode::TradingMode;
    use chrono::NaiveDate;

    /// Ascending synthetic uptrend: close climbs `step` per day with a
    /// constant intraday range.
    fn trend_bars(days: usize, start: f64, step: f64, range: f64) -> Vec<DailyBar> {
        (0..days)
            .map(|i| {
                let close = start + step * i as f64;
                DailyBar {
                    date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
                        + chrono::Duration::days(i as i64),
                    open: close - step / 2.0,
                    high: close + range / 2.0,
                    low: close - range / 2.0,
                    close,
                    volume: 100_000,
                }
            })
            .collect()
    }

    fn strategy() -> TrendAtrStrategy {
        TrendAtrStrategy::default()
    }

    #[test]
    fn test_wilder_atr_constant_range() {
        let bars = trend_bars(40, 100.0, 0.0, 4.0);
        let atr = wilder_atr(&bars, 14).unwrap();
        assert!((atr - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_buy_in_uptrend() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let price = bars.last().unwrap().close + 100.0;
        let decision = strategy().evaluate("005930", None, &bars, price);
        assert_eq!(decision.signal, Signal::Buy);
        let stop = decision.suggested_stop.unwrap();
        let take = decision.suggested_take_profit.unwrap();
        let atr = decision.atr_at_entry.unwrap();
        assert!(stop < price && price < take);
        assert!(atr > 0.0);
        assert!((price - stop - 2.0 * atr).abs() < 1e-6);
    }

    #[test]
    fn test_hold_with_short_history() {
        let bars = trend_bars(20, 50_000.0, 200.0, 800.0);
        let decision = strategy().evaluate("005930", None, &bars, 60_000.0);
        assert_eq!(decision.signal, Signal::Hold);
    }

    #[test]
    fn test_hold_below_ma() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let decision = strategy().evaluate("005930", None, &bars, 40_000.0);
        assert_eq!(decision.signal, Signal::Hold);
    }

    fn open_position(bars: &[DailyBar]) -> Position {
        let entry = bars.last().unwrap().close;
        Position::entered(
            "005930",
            TradingMode::Paper,
            entry,
            10,
            1_000.0,
            entry - 2_000.0,
            entry + 3_000.0,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn test_stop_exit() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let pos = open_position(&bars);
        let decision = strategy().evaluate("005930", Some(&pos), &bars, pos.stop_loss);
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::AtrStop));
    }

    #[test]
    fn test_trailing_exit_when_armed() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let mut pos = open_position(&bars);
        pos.observe_price(pos.entry_price + 4_000.0);
        pos.advance_trailing(2.0, 1.0);
        assert!(pos.trailing_stop > pos.stop_loss);
        let decision = strategy().evaluate("005930", Some(&pos), &bars, pos.trailing_stop);
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn test_take_profit_exit() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let pos = open_position(&bars);
        let decision = strategy().evaluate("005930", Some(&pos), &bars, pos.take_profit + 1.0);
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_trend_broken_exit() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let mut pos = open_position(&bars);
        // Wide stops so only the MA break can fire.
        pos.stop_loss = 1_000.0;
        pos.take_profit = 200_000.0;
        let ma = sma_close(&bars, 50).unwrap();
        let decision = strategy().evaluate("005930", Some(&pos), &bars, ma - 100.0);
        assert_eq!(decision.signal, Signal::Sell);
        assert_eq!(decision.exit_reason, Some(ExitReason::TrendBroken));
    }

    #[test]
    fn test_pure_function() {
        let bars = trend_bars(60, 50_000.0, 200.0, 800.0);
        let price = bars.last().unwrap().close + 100.0;
        let s = strategy();
        let a = s.evaluate("005930", None, &bars, price);
        let b = s.evaluate("005930", None, &bars, price);
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.suggested_stop, b.suggested_stop);
        assert_eq!(a.reason, b.reason);
    }
}
