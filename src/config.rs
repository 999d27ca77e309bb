//! Runtime configuration.
//!
//! Values come from process environment variables with CLI overrides laid
//! on top. The effective trading mode must equal the environment-declared
//! mode or startup aborts; `REAL` additionally requires the explicit
//! confirmation flag.

use crate::application::universe::{SelectionMethod, UniverseConfig};
use crate::domain::entities::mode::TradingMode;
use crate::domain::errors::EngineError;
use crate::domain::services::risk_controller::RiskConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Hard floor for the cycle period.
pub const MIN_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_NEAR_STOP_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_EXECUTION_TIMEOUT_SECONDS: u64 = 45;
pub const DEFAULT_PENDING_EXIT_BACKOFF_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub account_no: String,
    pub account_product_code: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: TradingMode,
    pub interval: Duration,
    pub near_stop_interval: Duration,
    pub order_execution_timeout: Duration,
    pub pending_exit_backoff: Duration,
    /// `None` disables gap protection.
    pub gap_threshold_pct: Option<f64>,
    pub gap_epsilon_pct: f64,
    pub trailing_atr_multiplier: f64,
    pub trailing_activation_pct: f64,
    /// Distance to stop (in entry ATRs) that switches to the fast cadence.
    pub near_stop_band_atr: f64,
    pub max_positions: usize,
    pub order_quantity: i64,
    pub enforce_single_instance: bool,
    pub data_dir: PathBuf,
    pub database_url: String,
    pub risk: RiskConfig,
    pub universe: UniverseConfig,
    pub credentials: BrokerCredentials,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key).map(|v| v.to_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "y"),
        None => default,
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let mode: TradingMode = env_var("TRADING_MODE")
            .unwrap_or_else(|| "PAPER".to_string())
            .parse()
            .map_err(EngineError::Config)?;

        let interval_seconds =
            env_parse("INTERVAL_SECONDS", DEFAULT_INTERVAL_SECONDS).max(MIN_INTERVAL_SECONDS);
        let near_stop_seconds = env_parse(
            "NEAR_STOP_INTERVAL_SECONDS",
            DEFAULT_NEAR_STOP_INTERVAL_SECONDS,
        )
        .max(MIN_INTERVAL_SECONDS);

        let data_dir = PathBuf::from(env_var("DATA_DIR").unwrap_or_else(|| "data".to_string()));

        let gap_threshold_pct = env_var("GAP_THRESHOLD_PCT")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| *v > 0.0);

        let fixed_stocks: Vec<String> = env_var("FIXED_STOCKS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let method: SelectionMethod = env_var("UNIVERSE_SELECTION_METHOD")
            .unwrap_or_else(|| "fixed".to_string())
            .parse()
            .map_err(EngineError::Config)?;

        let max_stocks = env_parse("MAX_STOCKS", 5usize);
        let universe = UniverseConfig {
            method,
            max_stocks: env_parse("UNIVERSE_SIZE", max_stocks),
            fixed_stocks,
            min_volume: env_parse("MIN_VOLUME", 100_000i64),
            min_market_cap: env_var("MIN_MARKET_CAP").and_then(|v| v.trim().parse().ok()),
            min_atr_pct: env_parse("MIN_ATR_PCT", 1.0f64),
            max_atr_pct: env_parse("MAX_ATR_PCT", 8.0f64),
            atr_period: env_parse("ATR_PERIOD", 14usize),
            halt_on_fallback_in_real: env_bool("HALT_ON_FALLBACK_IN_REAL", true),
        };

        let risk = RiskConfig {
            daily_max_loss_pct: env_parse("DAILY_MAX_LOSS_PCT", 3.0f64),
            per_trade_max_loss_pct: env_parse("PER_TRADE_MAX_LOSS_PCT", 5.0f64),
            cumulative_dd_pct: env_parse("CUMULATIVE_DD_PCT", 15.0f64),
            max_consecutive_losses: env_parse("MAX_CONSECUTIVE_LOSSES", 3u32),
            daily_max_trades: env_parse("DAILY_MAX_TRADES", 10u32),
            kill_switch_path: data_dir.join("KILL_SWITCH"),
        };

        let credentials = BrokerCredentials {
            app_key: env_var("KIS_APP_KEY").unwrap_or_default(),
            app_secret: env_var("KIS_APP_SECRET").unwrap_or_default(),
            account_no: env_var("KIS_ACCOUNT_NO").unwrap_or_default(),
            account_product_code: env_var("KIS_ACCOUNT_PRODUCT_CODE")
                .unwrap_or_else(|| "01".to_string()),
        };

        let database_url = env_var("DATABASE_URL")
            .unwrap_or_else(|| format!("sqlite://{}/trader.db", data_dir.display()));

        Ok(AppConfig {
            mode,
            interval: Duration::from_secs(interval_seconds),
            near_stop_interval: Duration::from_secs(near_stop_seconds),
            order_execution_timeout: Duration::from_secs(env_parse(
                "ORDER_EXECUTION_TIMEOUT",
                DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            )),
            pending_exit_backoff: Duration::from_secs(env_parse(
                "PENDING_EXIT_BACKOFF_SECONDS",
                DEFAULT_PENDING_EXIT_BACKOFF_SECONDS,
            )),
            gap_threshold_pct,
            gap_epsilon_pct: env_parse("GAP_EPSILON_PCT", 0.1f64),
            trailing_atr_multiplier: env_parse("TRAILING_STOP_ATR_MULTIPLIER", 2.0f64),
            trailing_activation_pct: env_parse("TRAILING_STOP_ACTIVATION_PCT", 1.0f64),
            near_stop_band_atr: env_parse("NEAR_STOP_BAND_ATR", 0.3f64),
            max_positions: env_parse("MAX_POSITIONS", max_stocks),
            order_quantity: env_parse("ORDER_QUANTITY", 1i64),
            enforce_single_instance: env_bool("ENFORCE_SINGLE_INSTANCE", true),
            data_dir,
            database_url,
            risk,
            universe,
            credentials,
        })
    }

    /// Validate CLI-declared intent against the environment-declared mode.
    /// `cbt` runs signal-only and therefore requires `DRY_RUN`; `trade`
    /// requires a live-capable mode, and `REAL` demands the confirmation
    /// flag on top.
    pub fn check_cli_mode(
        &self,
        run_mode: &str,
        confirm_real_trading: bool,
    ) -> Result<(), EngineError> {
        match run_mode {
            "cbt" => {
                if self.mode != TradingMode::DryRun {
                    return Err(EngineError::Config(format!(
                        "--mode cbt requires TRADING_MODE=DRY_RUN (environment declares {})",
                        self.mode
                    )));
                }
            }
            "trade" => {
                if self.mode == TradingMode::DryRun {
                    return Err(EngineError::Config(
                        "--mode trade requires TRADING_MODE=PAPER or REAL".to_string(),
                    ));
                }
                if self.mode == TradingMode::Real && !confirm_real_trading {
                    return Err(EngineError::Config(
                        "REAL mode requires --confirm-real-trading".to_string(),
                    ));
                }
            }
            other => {
                return Err(EngineError::Config(format!("unknown run mode: {}", other)));
            }
        }
        Ok(())
    }

    pub fn positions_file(&self) -> PathBuf {
        self.data_dir.join("positions.json")
    }

    pub fn universe_cache_file(&self) -> PathBuf {
        self.data_dir.join("universe_cache.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("instance.lock")
    }
}
