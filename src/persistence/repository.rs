//! Data access layer.
//!
//! One repository per table, all mode-scoped. Reads go through the pool;
//! the write helpers suffixed `_tx` take a live connection so the order
//! synchronizer can commit `order_state`, `trades` and `positions` changes
//! for one decision in a single transaction.

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::mode::TradingMode;
use crate::domain::entities::order::OrderStatus;
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::Trade;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, error};

fn query_err(context: &str, e: sqlx::Error) -> DatabaseError {
    error!("{}: {}", context, e);
    DatabaseError::QueryError(format!("{}: {}", context, e))
}

// ════════════════════════════════════════════════════════════════
// Positions
// ════════════════════════════════════════════════════════════════

pub struct PositionRepository {
    pool: DbPool,
    mode: TradingMode,
}

impl PositionRepository {
    pub fn new(pool: DbPool, mode: TradingMode) -> Self {
        Self { pool, mode }
    }

    pub async fn upsert(&self, position: &Position) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::upsert_tx(&mut conn, position).await
    }

    /// Insert or replace the row for `(symbol, mode)`. History of closed
    /// rounds lives in `trades`; the position row always reflects the
    /// latest round.
    pub async fn upsert_tx(
        conn: &mut SqliteConnection,
        position: &Position,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO positions (
                symbol, mode, stock_name, entry_price, quantity, entry_time,
                atr_at_entry, stop_loss, take_profit, trailing_stop,
                highest_price, current_price, unrealized_pnl, state,
                exit_price, exit_reason, exit_time, realized_pnl,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, ?19, ?19)
            ON CONFLICT(symbol, mode) DO UPDATE SET
                stock_name = excluded.stock_name,
                entry_price = excluded.entry_price,
                quantity = excluded.quantity,
                entry_time = excluded.entry_time,
                atr_at_entry = excluded.atr_at_entry,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                trailing_stop = excluded.trailing_stop,
                highest_price = excluded.highest_price,
                current_price = excluded.current_price,
                unrealized_pnl = excluded.unrealized_pnl,
                state = excluded.state,
                exit_price = excluded.exit_price,
                exit_reason = excluded.exit_reason,
                exit_time = excluded.exit_time,
                realized_pnl = excluded.realized_pnl,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(position.mode.as_str())
        .bind(&position.stock_name)
        .bind(position.entry_price)
        .bind(position.quantity)
        .bind(position.entry_time)
        .bind(position.atr_at_entry)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.trailing_stop)
        .bind(position.highest_price)
        .bind(position.entry_price)
        .bind(0.0_f64)
        .bind(position.state.as_str())
        .bind(position.exit_price)
        .bind(position.exit_reason.map(|r| r.as_str().to_string()))
        .bind(position.exit_time)
        .bind(position.realized_pnl)
        .bind(now)
        .execute(conn)
        .await
        .map_err(|e| query_err("failed to upsert position", e))?;

        debug!("Upserted position {} ({})", position.symbol, position.state.as_str());
        Ok(())
    }

    pub async fn get(&self, symbol: &str) -> Result<Option<Position>, DatabaseError> {
        let record = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE symbol = ?1 AND mode = ?2",
        )
        .bind(symbol)
        .bind(self.mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("failed to get position", e))?;

        record
            .map(|r| r.into_position().map_err(DatabaseError::QueryError))
            .transpose()
    }

    /// Open (`ENTERED`) positions for this mode.
    pub async fn get_open(&self) -> Result<Vec<Position>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE state = 'ENTERED' AND mode = ?1 ORDER BY entry_time",
        )
        .bind(self.mode.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_err("failed to get open positions", e))?;

        records
            .into_iter()
            .map(|r| r.into_position().map_err(DatabaseError::QueryError))
            .collect()
    }

    /// Refresh mark-to-market fields after a price observation. Leaves the
    /// frozen entry fields untouched.
    pub async fn update_marks(
        &self,
        symbol: &str,
        current_price: f64,
        unrealized_pnl: f64,
        highest_price: f64,
        trailing_stop: f64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET current_price = ?1, unrealized_pnl = ?2, highest_price = ?3,
                trailing_stop = ?4, updated_at = ?5
            WHERE symbol = ?6 AND mode = ?7 AND state = 'ENTERED'
            "#,
        )
        .bind(current_price)
        .bind(unrealized_pnl)
        .bind(highest_price)
        .bind(trailing_stop)
        .bind(Utc::now())
        .bind(symbol)
        .bind(self.mode.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to update position marks", e))?;
        Ok(())
    }

    pub async fn mark_exited_tx(
        conn: &mut SqliteConnection,
        symbol: &str,
        mode: TradingMode,
        exit_price: f64,
        exit_reason: &str,
        realized_pnl: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = sqlx::query(
            r#"
            UPDATE positions
            SET state = 'EXITED', exit_price = ?1, exit_reason = ?2,
                exit_time = ?3, realized_pnl = ?4, updated_at = ?3
            WHERE symbol = ?5 AND mode = ?6 AND state = 'ENTERED'
            "#,
        )
        .bind(exit_price)
        .bind(exit_reason)
        .bind(exit_time)
        .bind(realized_pnl)
        .bind(symbol)
        .bind(mode.as_str())
        .execute(conn)
        .await
        .map_err(|e| query_err("failed to mark position exited", e))?
        .rows_affected();

        if affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "no open position to exit: {}",
                symbol
            )));
        }
        Ok(())
    }

    /// Partial sell: shrink the open quantity, leave everything else as is.
    pub async fn reduce_quantity_tx(
        conn: &mut SqliteConnection,
        symbol: &str,
        mode: TradingMode,
        sold_qty: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET quantity = quantity - ?1, updated_at = ?2
            WHERE symbol = ?3 AND mode = ?4 AND state = 'ENTERED' AND quantity >= ?1
            "#,
        )
        .bind(sold_qty)
        .bind(Utc::now())
        .bind(symbol)
        .bind(mode.as_str())
        .execute(conn)
        .await
        .map_err(|e| query_err("failed to reduce position quantity", e))?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════
// Order state
// ════════════════════════════════════════════════════════════════

pub struct OrderStateRepository {
    pool: DbPool,
    mode: TradingMode,
}

impl OrderStateRepository {
    pub fn new(pool: DbPool, mode: TradingMode) -> Self {
        Self { pool, mode }
    }

    pub async fn get(&self, key: &str) -> Result<Option<OrderStateRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderStateRecord>(
            "SELECT * FROM order_state WHERE idempotency_key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("failed to get order state", e))
    }

    pub async fn insert_pending(&self, create: &CreateOrderState) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO order_state (
                idempotency_key, signal_id, symbol, side, requested_qty,
                filled_qty, remaining_qty, order_no, fill_price, status,
                mode, requested_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?5, NULL, 0, 'PENDING', ?6, ?7, ?7)
            "#,
        )
        .bind(&create.idempotency_key)
        .bind(&create.signal_id)
        .bind(&create.symbol)
        .bind(&create.side)
        .bind(create.requested_qty)
        .bind(&create.mode)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to insert pending order state", e))?;
        Ok(())
    }

    pub async fn mark_submitted(&self, key: &str, order_no: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE order_state
            SET status = 'SUBMITTED', order_no = ?1, updated_at = ?2
            WHERE idempotency_key = ?3 AND status = 'PENDING'
            "#,
        )
        .bind(order_no)
        .bind(Utc::now())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to mark order submitted", e))?;
        Ok(())
    }

    /// Terminal failure with no fill. Used when the broker rejects the
    /// submission outright.
    pub async fn mark_failed(&self, key: &str) -> Result<(), DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Self::finalize_tx(&mut conn, key, OrderStatus::Failed, 0, 0.0).await
    }

    /// Move the row to `status` with cumulative fill figures. Terminal rows
    /// are immutable: the guard clause refuses to touch them.
    pub async fn finalize_tx(
        conn: &mut SqliteConnection,
        key: &str,
        status: OrderStatus,
        filled_qty: i64,
        fill_price: f64,
    ) -> Result<(), DatabaseError> {
        let affected = sqlx::query(
            r#"
            UPDATE order_state
            SET status = ?1, filled_qty = ?2,
                remaining_qty = requested_qty - ?2,
                fill_price = ?3, updated_at = ?4
            WHERE idempotency_key = ?5
              AND status NOT IN ('FILLED', 'CANCELLED', 'FAILED')
            "#,
        )
        .bind(status.as_str())
        .bind(filled_qty)
        .bind(fill_price)
        .bind(Utc::now())
        .bind(key)
        .execute(conn)
        .await
        .map_err(|e| query_err("failed to finalize order state", e))?
        .rows_affected();

        if affected == 0 {
            return Err(DatabaseError::QueryError(format!(
                "order state is terminal or missing: {}",
                key
            )));
        }
        Ok(())
    }

    /// Rows a restarted process must resume: submitted or partially filled
    /// orders that still have a broker order number.
    pub async fn recoverable(&self) -> Result<Vec<OrderStateRecord>, DatabaseError> {
        sqlx::query_as::<_, OrderStateRecord>(
            r#"
            SELECT * FROM order_state
            WHERE mode = ?1 AND status IN ('SUBMITTED', 'PARTIAL')
              AND order_no IS NOT NULL
            ORDER BY requested_at
            "#,
        )
        .bind(self.mode.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_err("failed to load recoverable orders", e))
    }

    /// How many orders for this symbol/side already reached a terminal
    /// state today. Callers derive the retry sequence number from it, so
    /// concurrent duplicates land on the same idempotency key while a
    /// retry after a confirmed terminal state gets a fresh one.
    pub async fn terminal_count_for_day(
        &self,
        symbol: &str,
        side: &str,
        day: NaiveDate,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM order_state
            WHERE mode = ?1 AND symbol = ?2 AND side = ?3
              AND status IN ('FILLED', 'CANCELLED', 'FAILED')
              AND date(requested_at) = ?4
            "#,
        )
        .bind(self.mode.as_str())
        .bind(symbol)
        .bind(side)
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_err("failed to count terminal orders", e))?;
        Ok(row.0)
    }

    /// Stale cleanup. `PENDING` rows that never got an order number are
    /// cancelled after 15 minutes; any non-terminal row is cancelled after
    /// 240 minutes. Returns how many rows were cancelled.
    pub async fn cancel_stale(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let pending_cutoff = now - Duration::minutes(15);
        let hard_cutoff = now - Duration::minutes(240);

        let pending = sqlx::query(
            r#"
            UPDATE order_state
            SET status = 'CANCELLED', remaining_qty = requested_qty - filled_qty, updated_at = ?1
            WHERE mode = ?2 AND status = 'PENDING' AND order_no IS NULL
              AND requested_at < ?3
            "#,
        )
        .bind(now)
        .bind(self.mode.as_str())
        .bind(pending_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to cancel stale pending orders", e))?
        .rows_affected();

        let old = sqlx::query(
            r#"
            UPDATE order_state
            SET status = 'CANCELLED', remaining_qty = requested_qty - filled_qty, updated_at = ?1
            WHERE mode = ?2 AND status IN ('PENDING', 'SUBMITTED', 'PARTIAL')
              AND requested_at < ?3
            "#,
        )
        .bind(now)
        .bind(self.mode.as_str())
        .bind(hard_cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to cancel aged orders", e))?
        .rows_affected();

        Ok(pending + old)
    }
}

// ════════════════════════════════════════════════════════════════
// Trades
// ════════════════════════════════════════════════════════════════

pub struct TradeRepository {
    pool: DbPool,
    mode: TradingMode,
}

impl TradeRepository {
    pub fn new(pool: DbPool, mode: TradingMode) -> Self {
        Self { pool, mode }
    }

    /// Insert a fill. The unique index on `idempotency_key` makes replays
    /// a no-op, which is what absorbs submit races. Returns whether a row
    /// was actually inserted so callers can skip the position side-effects
    /// of an already-settled decision.
    pub async fn insert_tx(
        conn: &mut SqliteConnection,
        trade: &Trade,
        mode: TradingMode,
    ) -> Result<bool, DatabaseError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO trades (
                idempotency_key, symbol, side, price, quantity, executed_at,
                reason, pnl, pnl_pct, entry_price, holding_days, order_no, mode
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(idempotency_key) DO NOTHING
            "#,
        )
        .bind(&trade.idempotency_key)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.executed_at)
        .bind(trade.reason.map(|r| r.as_str().to_string()))
        .bind(trade.pnl)
        .bind(trade.pnl_pct)
        .bind(trade.entry_price)
        .bind(trade.holding_days)
        .bind(&trade.order_no)
        .bind(mode.as_str())
        .execute(conn)
        .await
        .map_err(|e| query_err("failed to insert trade", e))?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Option<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades WHERE idempotency_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_err("failed to get trade", e))
    }

    pub async fn get_by_symbol(&self, symbol: &str) -> Result<Vec<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE symbol = ?1 AND mode = ?2 ORDER BY id",
        )
        .bind(symbol)
        .bind(self.mode.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_err("failed to get trades by symbol", e))
    }

    pub async fn count_for_day(&self, day: NaiveDate) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM trades WHERE mode = ?1 AND date(executed_at) = ?2",
        )
        .bind(self.mode.as_str())
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_err("failed to count trades", e))?;
        Ok(row.0)
    }

    pub async fn realized_pnl_for_day(&self, day: NaiveDate) -> Result<f64, DatabaseError> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(pnl) FROM trades WHERE mode = ?1 AND date(executed_at) = ?2",
        )
        .bind(self.mode.as_str())
        .bind(day)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_err("failed to sum realized pnl", e))?;
        Ok(row.0.unwrap_or(0.0))
    }
}

// ════════════════════════════════════════════════════════════════
// Account snapshots
// ════════════════════════════════════════════════════════════════

pub struct AccountSnapshotRepository {
    pool: DbPool,
    mode: TradingMode,
}

impl AccountSnapshotRepository {
    pub fn new(pool: DbPool, mode: TradingMode) -> Self {
        Self { pool, mode }
    }

    pub async fn insert(
        &self,
        snapshot_time: DateTime<Utc>,
        total_equity: f64,
        cash: f64,
        unrealized_pnl: f64,
        realized_pnl: f64,
        position_count: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots (
                snapshot_time, mode, total_equity, cash, unrealized_pnl,
                realized_pnl, position_count
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(snapshot_time, mode) DO NOTHING
            "#,
        )
        .bind(snapshot_time)
        .bind(self.mode.as_str())
        .bind(total_equity)
        .bind(cash)
        .bind(unrealized_pnl)
        .bind(realized_pnl)
        .bind(position_count)
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to insert account snapshot", e))?;
        Ok(())
    }

    pub async fn latest(&self) -> Result<Option<AccountSnapshotRecord>, DatabaseError> {
        sqlx::query_as::<_, AccountSnapshotRecord>(
            "SELECT * FROM account_snapshots WHERE mode = ?1 ORDER BY snapshot_time DESC LIMIT 1",
        )
        .bind(self.mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("failed to get latest snapshot", e))
    }
}

// ════════════════════════════════════════════════════════════════
// Symbol cache
// ════════════════════════════════════════════════════════════════

pub struct SymbolCacheRepository {
    pool: DbPool,
}

impl SymbolCacheRepository {
    /// Entries older than this are treated as missing and refreshed
    /// best-effort; expiry never blocks trading.
    pub const TTL_DAYS: i64 = 30;

    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_fresh(
        &self,
        stock_code: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SymbolCacheRecord>, DatabaseError> {
        let cutoff = now - Duration::days(Self::TTL_DAYS);
        sqlx::query_as::<_, SymbolCacheRecord>(
            "SELECT * FROM symbol_cache WHERE stock_code = ?1 AND updated_at >= ?2",
        )
        .bind(stock_code)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("failed to read symbol cache", e))
    }

    pub async fn upsert(&self, stock_code: &str, stock_name: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO symbol_cache (stock_code, stock_name, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(stock_code) DO UPDATE SET
                stock_name = excluded.stock_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(stock_code)
        .bind(stock_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to upsert symbol cache", e))?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════
// Daily summary
// ════════════════════════════════════════════════════════════════

pub struct DailySummaryRepository {
    pool: DbPool,
    mode: TradingMode,
}

impl DailySummaryRepository {
    pub fn new(pool: DbPool, mode: TradingMode) -> Self {
        Self { pool, mode }
    }

    /// Fold one closed trade into the day's aggregate row.
    pub async fn record_closed_trade(
        &self,
        day: NaiveDate,
        pnl: f64,
    ) -> Result<(), DatabaseError> {
        let win = if pnl > 0.0 { 1 } else { 0 };
        let loss = if pnl < 0.0 { 1 } else { 0 };
        sqlx::query(
            r#"
            INSERT INTO daily_summary (
                summary_date, mode, trades_count, realized_pnl, win_count, loss_count, updated_at
            )
            VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)
            ON CONFLICT(summary_date, mode) DO UPDATE SET
                trades_count = trades_count + 1,
                realized_pnl = realized_pnl + excluded.realized_pnl,
                win_count = win_count + excluded.win_count,
                loss_count = loss_count + excluded.loss_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(day)
        .bind(self.mode.as_str())
        .bind(pnl)
        .bind(win)
        .bind(loss)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_err("failed to update daily summary", e))?;
        Ok(())
    }

    pub async fn get(&self, day: NaiveDate) -> Result<Option<DailySummaryRecord>, DatabaseError> {
        sqlx::query_as::<_, DailySummaryRecord>(
            "SELECT * FROM daily_summary WHERE summary_date = ?1 AND mode = ?2",
        )
        .bind(day)
        .bind(self.mode.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_err("failed to read daily summary", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::trade::ExitReason;
    use crate::persistence::init_database;

    async fn pool() -> DbPool {
        init_database("sqlite::memory:").await.unwrap()
    }

    fn sample_position() -> Position {
        Position::entered(
            "005930",
            TradingMode::Paper,
            70_000.0,
            10,
            1_500.0,
            67_000.0,
            74_500.0,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_position_round_trip() {
        let pool = pool().await;
        let repo = PositionRepository::new(pool, TradingMode::Paper);
        repo.upsert(&sample_position()).await.unwrap();

        let loaded = repo.get("005930").await.unwrap().unwrap();
        assert_eq!(loaded.quantity, 10);
        assert_eq!(loaded.atr_at_entry, 1_500.0);
        assert_eq!(
            loaded.state,
            crate::domain::entities::position::PositionState::Entered
        );
    }

    #[tokio::test]
    async fn test_positions_are_mode_scoped() {
        let pool = pool().await;
        let paper = PositionRepository::new(pool.clone(), TradingMode::Paper);
        let real = PositionRepository::new(pool, TradingMode::Real);
        paper.upsert(&sample_position()).await.unwrap();

        assert!(paper.get("005930").await.unwrap().is_some());
        assert!(real.get("005930").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_exited_requires_open_row() {
        let pool = pool().await;
        let repo = PositionRepository::new(pool.clone(), TradingMode::Paper);
        repo.upsert(&sample_position()).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        PositionRepository::mark_exited_tx(
            &mut conn,
            "005930",
            TradingMode::Paper,
            73_500.0,
            "TAKE_PROFIT",
            35_000.0,
            Utc::now(),
        )
        .await
        .unwrap();

        // Second exit of the same round must fail.
        let err = PositionRepository::mark_exited_tx(
            &mut conn,
            "005930",
            TradingMode::Paper,
            73_500.0,
            "TAKE_PROFIT",
            35_000.0,
            Utc::now(),
        )
        .await;
        assert!(err.is_err());
    }

    fn pending(key: &str) -> CreateOrderState {
        CreateOrderState {
            idempotency_key: key.to_string(),
            signal_id: "sig-1".to_string(),
            symbol: "005930".to_string(),
            side: "BUY".to_string(),
            requested_qty: 10,
            mode: "PAPER".to_string(),
        }
    }

    #[tokio::test]
    async fn test_order_state_transitions() {
        let pool = pool().await;
        let repo = OrderStateRepository::new(pool.clone(), TradingMode::Paper);
        repo.insert_pending(&pending("key-1")).await.unwrap();
        repo.mark_submitted("key-1", "ORD-1").await.unwrap();

        let row = repo.get("key-1").await.unwrap().unwrap();
        assert_eq!(row.status, "SUBMITTED");
        assert_eq!(row.order_no.as_deref(), Some("ORD-1"));
        assert_eq!(row.filled_qty + row.remaining_qty, row.requested_qty);

        let mut conn = pool.acquire().await.unwrap();
        OrderStateRepository::finalize_tx(&mut conn, "key-1", OrderStatus::Filled, 10, 71_000.0)
            .await
            .unwrap();
        drop(conn);

        let row = repo.get("key-1").await.unwrap().unwrap();
        assert_eq!(row.status, "FILLED");
        assert_eq!(row.filled_qty, 10);
        assert_eq!(row.remaining_qty, 0);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_immutable() {
        let pool = pool().await;
        let repo = OrderStateRepository::new(pool.clone(), TradingMode::Paper);
        repo.insert_pending(&pending("key-2")).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        OrderStateRepository::finalize_tx(&mut conn, "key-2", OrderStatus::Cancelled, 0, 0.0)
            .await
            .unwrap();

        let err =
            OrderStateRepository::finalize_tx(&mut conn, "key-2", OrderStatus::Filled, 10, 70_000.0)
                .await;
        assert!(err.is_err());
        drop(conn);

        let row = repo.get("key-2").await.unwrap().unwrap();
        assert_eq!(row.status, "CANCELLED");
    }

    #[tokio::test]
    async fn test_duplicate_pending_insert_rejected() {
        let pool = pool().await;
        let repo = OrderStateRepository::new(pool, TradingMode::Paper);
        repo.insert_pending(&pending("key-3")).await.unwrap();
        assert!(repo.insert_pending(&pending("key-3")).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_cleanup() {
        let pool = pool().await;
        let repo = OrderStateRepository::new(pool.clone(), TradingMode::Paper);
        repo.insert_pending(&pending("stale-pending")).await.unwrap();
        repo.insert_pending(&pending("stale-submitted")).await.unwrap();
        repo.mark_submitted("stale-submitted", "ORD-9").await.unwrap();

        // Nothing is stale yet.
        assert_eq!(repo.cancel_stale(Utc::now()).await.unwrap(), 0);

        // 20 minutes on: only the order-less PENDING row is stale.
        let cancelled = repo
            .cancel_stale(Utc::now() + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(
            repo.get("stale-pending").await.unwrap().unwrap().status,
            "CANCELLED"
        );
        assert_eq!(
            repo.get("stale-submitted").await.unwrap().unwrap().status,
            "SUBMITTED"
        );

        // 5 hours on: every non-terminal row is cancelled.
        let cancelled = repo
            .cancel_stale(Utc::now() + Duration::minutes(300))
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(
            repo.get("stale-submitted").await.unwrap().unwrap().status,
            "CANCELLED"
        );
    }

    fn sample_trade(key: &str) -> Trade {
        Trade {
            idempotency_key: key.to_string(),
            symbol: "005930".to_string(),
            side: OrderSide::Buy,
            price: 71_000.0,
            quantity: 10,
            executed_at: Utc::now(),
            reason: None,
            pnl: None,
            pnl_pct: None,
            entry_price: None,
            holding_days: None,
            order_no: Some("ORD-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_trade_insert_is_idempotent() {
        let pool = pool().await;
        let repo = TradeRepository::new(pool.clone(), TradingMode::Paper);
        let mut conn = pool.acquire().await.unwrap();

        TradeRepository::insert_tx(&mut conn, &sample_trade("t-1"), TradingMode::Paper)
            .await
            .unwrap();
        TradeRepository::insert_tx(&mut conn, &sample_trade("t-1"), TradingMode::Paper)
            .await
            .unwrap();
        drop(conn);

        let trades = repo.get_by_symbol("005930").await.unwrap();
        assert_eq!(trades.len(), 1);
    }

    #[tokio::test]
    async fn test_trade_day_aggregates() {
        let pool = pool().await;
        let repo = TradeRepository::new(pool.clone(), TradingMode::Paper);
        let mut conn = pool.acquire().await.unwrap();

        let mut sell = sample_trade("t-sell");
        sell.side = OrderSide::Sell;
        sell.reason = Some(ExitReason::TakeProfit);
        sell.pnl = Some(25_000.0);
        TradeRepository::insert_tx(&mut conn, &sell, TradingMode::Paper)
            .await
            .unwrap();
        drop(conn);

        let today = Utc::now().date_naive();
        assert_eq!(repo.count_for_day(today).await.unwrap(), 1);
        assert_eq!(repo.realized_pnl_for_day(today).await.unwrap(), 25_000.0);
    }

    #[tokio::test]
    async fn test_snapshot_and_summary() {
        let pool = pool().await;
        let snaps = AccountSnapshotRepository::new(pool.clone(), TradingMode::Paper);
        let now = Utc::now();
        snaps
            .insert(now, 10_000_000.0, 5_000_000.0, 100_000.0, 50_000.0, 2)
            .await
            .unwrap();
        // Same timestamp: first write wins, no duplicate key error.
        snaps
            .insert(now, 10_100_000.0, 5_000_000.0, 100_000.0, 50_000.0, 2)
            .await
            .unwrap();
        let latest = snaps.latest().await.unwrap().unwrap();
        assert_eq!(latest.total_equity, 10_000_000.0);

        let summary = DailySummaryRepository::new(pool, TradingMode::Paper);
        let day = now.date_naive();
        summary.record_closed_trade(day, 25_000.0).await.unwrap();
        summary.record_closed_trade(day, -10_000.0).await.unwrap();
        let row = summary.get(day).await.unwrap().unwrap();
        assert_eq!(row.trades_count, 2);
        assert_eq!(row.win_count, 1);
        assert_eq!(row.loss_count, 1);
        assert_eq!(row.realized_pnl, 15_000.0);
    }

    #[tokio::test]
    async fn test_symbol_cache_ttl() {
        let pool = pool().await;
        let cache = SymbolCacheRepository::new(pool);
        cache.upsert("005930", "Samsung Electronics").await.unwrap();

        let now = Utc::now();
        assert!(cache.get_fresh("005930", now).await.unwrap().is_some());
        // 31 days later the entry has expired.
        let later = now + Duration::days(31);
        assert!(cache.get_fresh("005930", later).await.unwrap().is_none());
    }
}
