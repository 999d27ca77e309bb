//! Persistence layer.
//!
//! SQLite via sqlx with async operations. Every table carries a `mode`
//! column; it participates in the primary key wherever the identity is
//! per-account so that dry-run and paper rows can never collide with real
//! ones.
//!
//! Tables: `positions`, `trades`, `order_state`, `account_snapshots`,
//! `symbol_cache`, `daily_summary`.

pub mod models;
pub mod position_file;
pub mod repository;
pub mod universe_cache;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool. Bounded: decisions write one transaction each.
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    MigrationError(String),

    #[error("query error: {0}")]
    QueryError(String),
}

/// Initialize the connection pool and run migrations.
///
/// `database_url` is an SQLite URL such as `sqlite://data/trader.db` or
/// `sqlite::memory:` for tests.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    // An in-memory database exists per connection; it must be pinned to a
    // single long-lived connection or every acquire sees an empty schema.
    let is_memory = database_url.contains(":memory:");
    let pool = SqlitePoolOptions::new()
        .max_connections(if is_memory { 1 } else { 5 })
        .min_connections(if is_memory { 1 } else { 0 })
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    let statements: &[(&str, &str)] = &[
        (
            "positions",
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT NOT NULL,
                mode TEXT NOT NULL CHECK(mode IN ('DRY_RUN', 'PAPER', 'REAL')),
                stock_name TEXT,
                entry_price REAL NOT NULL,
                quantity INTEGER NOT NULL,
                entry_time DATETIME NOT NULL,
                atr_at_entry REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit REAL NOT NULL,
                trailing_stop REAL NOT NULL DEFAULT 0,
                highest_price REAL NOT NULL,
                current_price REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                state TEXT NOT NULL CHECK(state IN ('PENDING', 'ENTERED', 'EXITED')),
                exit_price REAL,
                exit_reason TEXT,
                exit_time DATETIME,
                realized_pnl REAL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (symbol, mode)
            )
            "#,
        ),
        (
            "order_state",
            r#"
            CREATE TABLE IF NOT EXISTS order_state (
                idempotency_key TEXT PRIMARY KEY,
                signal_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
                requested_qty INTEGER NOT NULL,
                filled_qty INTEGER NOT NULL DEFAULT 0,
                remaining_qty INTEGER NOT NULL,
                order_no TEXT,
                fill_price REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK(status IN
                    ('PENDING', 'SUBMITTED', 'PARTIAL', 'FILLED', 'CANCELLED', 'FAILED')),
                mode TEXT NOT NULL,
                requested_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                CHECK(filled_qty + remaining_qty = requested_qty)
            )
            "#,
        ),
        (
            "trades",
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idempotency_key TEXT NOT NULL UNIQUE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('BUY', 'SELL')),
                price REAL NOT NULL,
                quantity INTEGER NOT NULL,
                executed_at DATETIME NOT NULL,
                reason TEXT,
                pnl REAL,
                pnl_pct REAL,
                entry_price REAL,
                holding_days INTEGER,
                order_no TEXT,
                mode TEXT NOT NULL
            )
            "#,
        ),
        (
            "account_snapshots",
            r#"
            CREATE TABLE IF NOT EXISTS account_snapshots (
                snapshot_time DATETIME NOT NULL,
                mode TEXT NOT NULL,
                total_equity REAL NOT NULL,
                cash REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                position_count INTEGER NOT NULL,
                PRIMARY KEY (snapshot_time, mode)
            )
            "#,
        ),
        (
            "symbol_cache",
            r#"
            CREATE TABLE IF NOT EXISTS symbol_cache (
                stock_code TEXT PRIMARY KEY,
                stock_name TEXT NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "daily_summary",
            r#"
            CREATE TABLE IF NOT EXISTS daily_summary (
                summary_date DATE NOT NULL,
                mode TEXT NOT NULL,
                trades_count INTEGER NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                win_count INTEGER NOT NULL DEFAULT 0,
                loss_count INTEGER NOT NULL DEFAULT 0,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (summary_date, mode)
            )
            "#,
        ),
    ];

    for (table, ddl) in statements {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("failed to create {} table: {}", table, e))
        })?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_positions_state ON positions(state)",
        "CREATE INDEX IF NOT EXISTS idx_order_state_status ON order_state(status)",
        "CREATE INDEX IF NOT EXISTS idx_order_state_requested_at ON order_state(requested_at)",
        "CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)",
        "CREATE INDEX IF NOT EXISTS idx_trades_executed_at ON trades(executed_at)",
    ];
    for ddl in indexes {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("failed to create index: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_all_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('positions', 'trades', 'order_state', 'account_snapshots', 'symbol_cache', 'daily_summary')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 6);
    }
}
