//! Binary entry point.
//!
//! Startup order: configuration and mode guard, single-instance lock,
//! database, broker client, reconciliation, then the execution loop.
//! Exit codes: 0 normal, 2 configuration/mode mismatch, 3 lock held,
//! 4 reconciliation critical, 5 kill-switch engaged.

use clap::Parser;
use kis_atr_trader::application::engine::executor::TradingEngine;
use kis_atr_trader::application::engine::instance_lock::{InstanceLock, STALE_LOCK_TIMEOUT};
use kis_atr_trader::application::universe::SelectionMethod;
use kis_atr_trader::config::{AppConfig, MIN_INTERVAL_SECONDS};
use kis_atr_trader::domain::entities::mode::TradingMode;
use kis_atr_trader::domain::errors::EngineError;
use kis_atr_trader::domain::repositories::broker::Broker;
use kis_atr_trader::domain::repositories::notifier::{LogNotifier, Notifier};
use kis_atr_trader::domain::services::strategy::TrendAtrStrategy;
use kis_atr_trader::infrastructure::kis_client::{KisClient, KisConfig};
use kis_atr_trader::persistence::init_database;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_LOCK_HELD: i32 = 3;
const EXIT_RECONCILIATION_CRITICAL: i32 = 4;
const EXIT_KILL_SWITCH: i32 = 5;

#[derive(Parser, Debug)]
#[command(name = "kis-atr-trader")]
#[command(about = "Multi-day trend/ATR trading engine for KRX equities")]
struct Cli {
    /// Run mode: `trade` drives orders, `cbt` evaluates signals only.
    #[arg(long, default_value = "trade")]
    mode: String,

    /// Market data feed. This build supports `rest`.
    #[arg(long, default_value = "rest")]
    feed: String,

    /// Cycle interval in seconds (floor 15).
    #[arg(long)]
    interval: Option<u64>,

    /// Stop after N cycles.
    #[arg(long)]
    max_runs: Option<u64>,

    /// Trade a single symbol instead of the configured universe.
    #[arg(long)]
    stock: Option<String>,

    /// Shares per order.
    #[arg(long)]
    order_quantity: Option<i64>,

    /// Required to run against the live account.
    #[arg(long, default_value_t = false)]
    confirm_real_trading: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kis_atr_trader=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = run(Cli::parse()).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let mut cfg = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };

    if cli.feed != "rest" {
        error!("unsupported feed: {} (this build trades over REST)", cli.feed);
        return EXIT_CONFIG;
    }
    if let Err(e) = cfg.check_cli_mode(&cli.mode, cli.confirm_real_trading) {
        error!("{}", e);
        return EXIT_CONFIG;
    }
    if let Some(seconds) = cli.interval {
        cfg.interval = Duration::from_secs(seconds.max(MIN_INTERVAL_SECONDS));
    }
    if let Some(qty) = cli.order_quantity {
        cfg.order_quantity = qty.max(1);
    }
    if let Some(stock) = &cli.stock {
        cfg.universe.method = SelectionMethod::Fixed;
        cfg.universe.fixed_stocks = vec![stock.clone()];
        cfg.universe.max_stocks = 1;
        cfg.max_positions = 1;
    }

    info!("starting: mode={} run_mode={}", cfg.mode, cli.mode);

    // Single-instance guard before anything that can trade.
    let mut lock = None;
    if cfg.enforce_single_instance {
        match InstanceLock::acquire(cfg.lock_file(), STALE_LOCK_TIMEOUT) {
            Ok(acquired) => lock = Some(acquired),
            Err(EngineError::LockHeld(holder)) => {
                error!("another instance is already running ({})", holder);
                return EXIT_LOCK_HELD;
            }
            Err(e) => {
                error!("lock acquisition failed: {}", e);
                return EXIT_CONFIG;
            }
        }
    }

    let pool = match init_database(&cfg.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("database initialization failed: {}", e);
            return EXIT_CONFIG;
        }
    };

    let broker: Arc<dyn Broker> = match KisClient::new(
        cfg.mode,
        KisConfig::for_mode(
            cfg.mode,
            cfg.credentials.app_key.clone(),
            cfg.credentials.app_secret.clone(),
            cfg.credentials.account_no.clone(),
            cfg.credentials.account_product_code.clone(),
        ),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("broker client initialization failed: {}", e);
            return EXIT_CONFIG;
        }
    };
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let strategy = Arc::new(TrendAtrStrategy::default());

    let initial_equity = match broker.get_account_balance().await {
        Ok(balance) if balance.total_equity > 0.0 => balance.total_equity,
        Ok(_) | Err(_) => {
            let fallback = std::env::var("STARTING_CAPITAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000_000.0);
            warn!("account equity unavailable; using starting capital {:.0}", fallback);
            fallback
        }
    };

    let mut engine = TradingEngine::new(
        cfg.clone(),
        broker,
        strategy,
        notifier,
        pool,
        initial_equity,
    );

    // Reconcile before trading; the broker account is the source of truth.
    let report = match engine.startup().await {
        Ok(report) => report,
        Err(e) => {
            error!("startup reconciliation failed: {}", e);
            return EXIT_RECONCILIATION_CRITICAL;
        }
    };
    if report.has_critical() && cfg.mode == TradingMode::Real {
        error!("critical reconciliation verdicts in REAL mode; refusing to trade");
        return EXIT_RECONCILIATION_CRITICAL;
    }

    // The kill-switch permits reconciliation but no new orders.
    if cfg.risk.kill_switch_path.exists() {
        error!(
            "kill-switch engaged at {}; remove the file to resume trading",
            cfg.risk.kill_switch_path.display()
        );
        return EXIT_KILL_SWITCH;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to install Ctrl+C handler: {}", e);
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => error!("failed to install SIGTERM handler: {}", e),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C"),
            _ = terminate => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    let code = match engine.run(cli.max_runs, shutdown_rx).await {
        Ok(()) => EXIT_OK,
        Err(EngineError::UniverseHalted(msg)) => {
            error!("trading halted: {}", msg);
            EXIT_CONFIG
        }
        Err(e) => {
            error!("engine stopped abnormally: {}", e);
            1
        }
    };

    if let Some(lock) = lock.as_mut() {
        lock.release();
    }
    code
}
