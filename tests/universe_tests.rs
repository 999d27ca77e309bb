//! Universe lifecycle: selection methods, per-day caching, and the
//! fallback chain.

mod common;

use chrono::NaiveDate;
use common::MockBroker;
use kis_atr_trader::application::universe::{SelectionMethod, UniverseConfig, UniverseService};
use kis_atr_trader::domain::entities::candle::DailyBar;
use kis_atr_trader::domain::entities::mode::TradingMode;
use kis_atr_trader::domain::errors::EngineError;
use kis_atr_trader::domain::repositories::broker::VolumeRankRow;
use kis_atr_trader::persistence::universe_cache::UniverseCacheFile;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 7, 31).unwrap()
}

fn rank_row(code: &str, trade_value: f64, volume: i64, change_rate: f64) -> VolumeRankRow {
    VolumeRankRow {
        stock_code: code.to_string(),
        stock_name: format!("Stock {}", code),
        trade_value,
        volume,
        market_cap: None,
        change_rate,
        is_suspended: false,
        is_management: false,
    }
}

/// Constant-range bars so ATR/close lands at a known ratio.
fn bars_with_atr_ratio(days: usize, close: f64, range: f64) -> Vec<DailyBar> {
    (0..days)
        .map(|i| DailyBar {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Duration::days(i as i64),
            open: close,
            high: close + range / 2.0,
            low: close - range / 2.0,
            close,
            volume: 1_000_000,
        })
        .rev() // broker order: newest first
        .collect()
}

fn service(
    broker: Arc<MockBroker>,
    dir: &tempfile::TempDir,
    cfg: UniverseConfig,
    mode: TradingMode,
) -> UniverseService {
    UniverseService::new(
        broker,
        UniverseCacheFile::new(dir.path().join("universe_cache.json")),
        cfg,
        mode,
    )
}

#[tokio::test]
async fn test_fixed_list_is_validated_deduped_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    let cfg = UniverseConfig {
        method: SelectionMethod::Fixed,
        max_stocks: 2,
        fixed_stocks: vec![
            "005930".to_string(),
            "005930".to_string(), // duplicate
            "BAD".to_string(),    // not a 6-digit code
            "000660".to_string(),
            "035420".to_string(), // beyond max_stocks
        ],
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["005930", "000660"]);
}

#[tokio::test]
async fn test_intraday_restart_reuses_cache_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker
        .volume_rows
        .lock()
        .unwrap()
        .extend([rank_row("005930", 9e9, 5_000_000, 1.0)]);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 3,
        ..UniverseConfig::default()
    };
    let service = service(broker.clone(), &dir, cfg, TradingMode::Paper);

    let first = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(first, vec!["005930"]);

    // Selection breaking intraday no longer matters: the cache answers.
    broker.fail_volume_ranking.store(true, Ordering::SeqCst);
    let second = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_volume_top_filters() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker.volume_rows.lock().unwrap().extend([
        rank_row("005930", 9e9, 5_000_000, 1.0),
        rank_row("000660", 8e9, 50, 0.5),        // volume below floor
        rank_row("035420", 7e9, 4_000_000, 29.5), // limit-move churn
        rank_row("035720", 6e9, 3_000_000, -2.0),
    ]);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 5,
        min_volume: 100_000,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["005930", "035720"]);
}

#[tokio::test]
async fn test_atr_filter_band_and_minimum_history() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    {
        let mut bars = broker.bars.lock().unwrap();
        // 4% ATR ratio: inside the 1..8 band.
        bars.insert("005930".to_string(), bars_with_atr_ratio(40, 50_000.0, 2_000.0));
        // 12% ratio: too volatile.
        bars.insert("000660".to_string(), bars_with_atr_ratio(40, 50_000.0, 6_000.0));
        // Not enough bars.
        bars.insert("035420".to_string(), bars_with_atr_ratio(10, 50_000.0, 2_000.0));
    }
    let cfg = UniverseConfig {
        method: SelectionMethod::AtrFilter,
        max_stocks: 5,
        fixed_stocks: vec![
            "005930".to_string(),
            "000660".to_string(),
            "035420".to_string(),
        ],
        min_atr_pct: 1.0,
        max_atr_pct: 8.0,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["005930"]);
}

#[tokio::test]
async fn test_fallback_to_fixed_list_when_selection_fails() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker.fail_volume_ranking.store(true, Ordering::SeqCst);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 2,
        fixed_stocks: vec!["005930".to_string(), "000660".to_string()],
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["005930", "000660"]);
}

#[tokio::test]
async fn test_fallback_to_empty_without_fixed_list() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker.fail_volume_ranking.store(true, Ordering::SeqCst);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 2,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert!(universe.is_empty());
}

#[tokio::test]
async fn test_empty_filtered_selection_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    // Ranking succeeds but every row is filtered out (limit-move churn).
    broker.volume_rows.lock().unwrap().extend([
        rank_row("005930", 9e9, 5_000_000, 29.9),
        rank_row("000660", 8e9, 4_000_000, -29.9),
    ]);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 2,
        fixed_stocks: vec!["035420".to_string()],
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["035420"]);
}

#[tokio::test]
async fn test_empty_filtered_selection_halts_in_real_mode() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker
        .volume_rows
        .lock()
        .unwrap()
        .extend([rank_row("005930", 9e9, 5_000_000, 29.9)]);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 2,
        fixed_stocks: vec!["035420".to_string()],
        halt_on_fallback_in_real: true,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Real);

    let result = service.todays_universe(day(), &[]).await;
    assert!(matches!(result, Err(EngineError::UniverseHalted(_))));
}

#[tokio::test]
async fn test_real_mode_fallback_halts_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker.fail_volume_ranking.store(true, Ordering::SeqCst);
    let cfg = UniverseConfig {
        method: SelectionMethod::VolumeTop,
        max_stocks: 2,
        fixed_stocks: vec!["005930".to_string()],
        halt_on_fallback_in_real: true,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Real);

    let result = service.todays_universe(day(), &[]).await;
    assert!(matches!(result, Err(EngineError::UniverseHalted(_))));
}

#[tokio::test]
async fn test_combined_runs_volume_then_atr() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(MockBroker::default());
    broker.volume_rows.lock().unwrap().extend([
        rank_row("005930", 9e9, 5_000_000, 1.0),
        rank_row("000660", 8e9, 4_000_000, 0.5),
    ]);
    {
        let mut bars = broker.bars.lock().unwrap();
        bars.insert("005930".to_string(), bars_with_atr_ratio(40, 50_000.0, 2_000.0));
        bars.insert("000660".to_string(), bars_with_atr_ratio(40, 50_000.0, 6_000.0));
    }
    let cfg = UniverseConfig {
        method: SelectionMethod::Combined,
        max_stocks: 2,
        ..UniverseConfig::default()
    };
    let service = service(broker, &dir, cfg, TradingMode::Paper);

    let universe = service.todays_universe(day(), &[]).await.unwrap();
    assert_eq!(universe, vec!["005930"]);
}
