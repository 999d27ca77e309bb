//! Order synchronizer end-to-end behavior against a scripted broker and an
//! in-memory store: confirmed-fill settlement, idempotent submission,
//! partial fills, crash recovery, and the pending-exit path.

mod common;

use common::{entered_position, MockBroker};
use kis_atr_trader::application::engine::synchronizer::{
    BuyDecision, OrderSynchronizer, SellDecision,
};
use kis_atr_trader::domain::entities::mode::TradingMode;
use kis_atr_trader::domain::entities::order::{idempotency_key, OrderSide, OrderStatus};
use kis_atr_trader::domain::entities::position::{Position, PositionState};
use kis_atr_trader::domain::entities::trade::ExitReason;
use kis_atr_trader::domain::repositories::broker::ExecutionStatus;
use kis_atr_trader::domain::repositories::notifier::testing::MemoryNotifier;
use kis_atr_trader::domain::repositories::notifier::Severity;
use kis_atr_trader::persistence::models::CreateOrderState;
use kis_atr_trader::persistence::repository::{
    OrderStateRepository, PositionRepository, TradeRepository,
};
use kis_atr_trader::persistence::{init_database, DbPool};
use std::sync::Arc;
use std::time::Duration;

const MODE: TradingMode = TradingMode::Paper;

struct Harness {
    pool: DbPool,
    broker: Arc<MockBroker>,
    notifier: Arc<MemoryNotifier>,
    sync: OrderSynchronizer,
}

async fn harness() -> Harness {
    let pool = init_database("sqlite::memory:").await.unwrap();
    let broker = Arc::new(MockBroker::default());
    let notifier = Arc::new(MemoryNotifier::default());
    let sync = OrderSynchronizer::new(
        broker.clone(),
        pool.clone(),
        MODE,
        notifier.clone(),
        Duration::from_secs(45),
        Duration::from_secs(300),
    );
    Harness {
        pool,
        broker,
        notifier,
        sync,
    }
}

fn buy(symbol: &str, qty: i64, price: f64, signal_id: &str) -> BuyDecision {
    BuyDecision {
        symbol: symbol.to_string(),
        qty,
        signal_id: signal_id.to_string(),
        reference_price: price,
        stop_loss: price - 3_000.0,
        take_profit: price + 4_500.0,
        atr_at_entry: 1_500.0,
        stock_name: None,
    }
}

fn sell(symbol: &str, qty: i64, price: f64, signal_id: &str, reason: ExitReason) -> SellDecision {
    SellDecision {
        symbol: symbol.to_string(),
        qty,
        signal_id: signal_id.to_string(),
        reference_price: price,
        reason,
    }
}

#[tokio::test]
async fn test_clean_buy_then_sell() {
    let h = harness().await;
    let positions = PositionRepository::new(h.pool.clone(), MODE);
    let trades = TradeRepository::new(h.pool.clone(), MODE);

    // Buy 10 @ 71,000, filled immediately.
    h.broker.script_fill(ExecutionStatus::Filled, 10, 71_000.0);
    let result = h
        .sync
        .execute_buy(&buy("005930", 10, 71_000.0, "entry-r0"))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.filled_qty, 10);

    let position = positions.get("005930").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Entered);
    assert_eq!(position.quantity, 10);
    assert_eq!(position.entry_price, 71_000.0);
    assert_eq!(position.atr_at_entry, 1_500.0);

    // Sell later at 73,500.
    h.broker.script_fill(ExecutionStatus::Filled, 10, 73_500.0);
    let result = h
        .sync
        .execute_sell(&sell("005930", 10, 73_500.0, "tp-r0", ExitReason::TakeProfit))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Filled);

    let position = positions.get("005930").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Exited);
    assert_eq!(position.exit_reason, Some(ExitReason::TakeProfit));
    assert_eq!(position.realized_pnl, Some(25_000.0));

    let rows = trades.get_by_symbol("005930").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].side, "BUY");
    assert_eq!(rows[1].side, "SELL");
    assert_eq!(rows[1].pnl, Some(25_000.0));
    assert_eq!(rows[1].reason.as_deref(), Some("TAKE_PROFIT"));

    assert_eq!(h.broker.placed_orders(), 2);
}

#[tokio::test]
async fn test_duplicate_submit_is_idempotent() {
    let h = harness().await;
    h.broker.script_fill(ExecutionStatus::Filled, 10, 70_000.0);

    let decision = buy("005930", 10, 70_000.0, "entry-r0");
    let first = h.sync.execute_buy(&decision).await.unwrap();
    assert_eq!(first.status, OrderStatus::Filled);

    // Identical decision again: no second broker submission, the stored
    // terminal outcome is returned.
    let second = h.sync.execute_buy(&decision).await.unwrap();
    assert_eq!(second.status, OrderStatus::Filled);
    assert_eq!(second.filled_qty, 10);
    assert_eq!(h.broker.placed_orders(), 1);

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    assert_eq!(trades.get_by_symbol("005930").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_fill_opens_reduced_position() {
    let h = harness().await;
    // 3 of 10 filled within the window, remainder cancelled by the client.
    h.broker.script_fill(ExecutionStatus::Partial, 3, 70_000.0);

    let result = h
        .sync
        .execute_buy(&buy("005930", 10, 70_000.0, "entry-r0"))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Partial);
    assert_eq!(result.filled_qty, 3);

    let orders = OrderStateRepository::new(h.pool.clone(), MODE);
    let row = orders.get(&result.idempotency_key).await.unwrap().unwrap();
    assert_eq!(row.status, "PARTIAL");
    assert_eq!(row.filled_qty, 3);
    assert_eq!(row.remaining_qty, 7);

    let positions = PositionRepository::new(h.pool.clone(), MODE);
    let position = positions.get("005930").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Entered);
    assert_eq!(position.quantity, 3);

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    let rows = trades.get_by_symbol("005930").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quantity, 3);
}

#[tokio::test]
async fn test_timeout_without_fill_cancels() {
    let h = harness().await;
    h.broker.script_fill(ExecutionStatus::Cancelled, 0, 0.0);

    let result = h
        .sync
        .execute_buy(&buy("005930", 10, 70_000.0, "entry-r0"))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Cancelled);
    assert_eq!(result.filled_qty, 0);

    let positions = PositionRepository::new(h.pool.clone(), MODE);
    let position = positions.get("005930").await.unwrap().unwrap();
    // Submitted-but-never-filled entries stay PENDING shells.
    assert_eq!(position.state, PositionState::Pending);

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    assert!(trades.get_by_symbol("005930").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_submit_is_terminal_failed_and_notified() {
    let h = harness().await;
    h.broker
        .reject_orders
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = h
        .sync
        .execute_buy(&buy("005930", 10, 70_000.0, "entry-r0"))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Failed);

    let orders = OrderStateRepository::new(h.pool.clone(), MODE);
    let row = orders.get(&result.idempotency_key).await.unwrap().unwrap();
    assert_eq!(row.status, "FAILED");

    let errors = h.notifier.kinds_at(Severity::Error);
    assert!(errors.contains(&"order_submit_failed".to_string()));
}

#[tokio::test]
async fn test_crash_between_submit_and_fill_resumes_without_resubmitting() {
    let h = harness().await;
    let orders = OrderStateRepository::new(h.pool.clone(), MODE);
    let positions = PositionRepository::new(h.pool.clone(), MODE);

    // State a previous process left behind: SUBMITTED order row plus the
    // PENDING position shell holding the frozen entry context.
    let key = idempotency_key(MODE, OrderSide::Buy, "005930", 10, "entry-r0");
    orders
        .insert_pending(&CreateOrderState {
            idempotency_key: key.clone(),
            signal_id: "entry-r0".to_string(),
            symbol: "005930".to_string(),
            side: "BUY".to_string(),
            requested_qty: 10,
            mode: MODE.as_str().to_string(),
        })
        .await
        .unwrap();
    orders.mark_submitted(&key, "ORD-77").await.unwrap();

    let mut shell = Position::entered(
        "005930",
        MODE,
        70_000.0,
        10,
        1_500.0,
        67_000.0,
        74_500.0,
        chrono::Utc::now(),
    );
    shell.state = PositionState::Pending;
    positions.upsert(&shell).await.unwrap();

    // The broker meanwhile filled 10 @ 70,100.
    h.broker.script_fill(ExecutionStatus::Filled, 10, 70_100.0);
    let resumed = h.sync.resume_open_orders().await.unwrap();
    assert_eq!(resumed, 1);

    // Same final state as an uninterrupted run; no duplicate submission.
    assert_eq!(h.broker.placed_orders(), 0);
    let row = orders.get(&key).await.unwrap().unwrap();
    assert_eq!(row.status, "FILLED");

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    let rows = trades.get_by_symbol("005930").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].price, 70_100.0);
    assert_eq!(rows[0].quantity, 10);

    let position = positions.get("005930").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Entered);
    assert_eq!(position.entry_price, 70_100.0);
    assert_eq!(position.atr_at_entry, 1_500.0);

    // Running recovery again changes nothing.
    let resumed = h.sync.resume_open_orders().await.unwrap();
    assert_eq!(resumed, 0);
    assert_eq!(trades.get_by_symbol("005930").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_sell_keeps_remainder_open() {
    let h = harness().await;
    let positions = PositionRepository::new(h.pool.clone(), MODE);
    positions
        .upsert(&entered_position("005930", MODE, 70_000.0, 10))
        .await
        .unwrap();

    h.broker.script_fill(ExecutionStatus::Partial, 4, 71_000.0);
    let result = h
        .sync
        .execute_sell(&sell("005930", 10, 71_000.0, "stop-r0", ExitReason::AtrStop))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Partial);
    assert_eq!(result.filled_qty, 4);

    let position = positions.get("005930").await.unwrap().unwrap();
    assert_eq!(position.state, PositionState::Entered);
    assert_eq!(position.quantity, 6);

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    let rows = trades.get_by_symbol("005930").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].quantity, 4);
    assert_eq!(rows[0].pnl, Some(4_000.0));
}

#[tokio::test]
async fn test_pending_exit_backoff_and_resolution() {
    let h = harness().await;
    let positions = PositionRepository::new(h.pool.clone(), MODE);
    positions
        .upsert(&entered_position("005930", MODE, 70_000.0, 10))
        .await
        .unwrap();

    h.sync
        .register_pending_exit("005930", ExitReason::AtrStop, "exits not allowed: CALL_AUCTION");
    assert!(h.sync.has_pending_exit("005930"));

    let now = chrono::Utc::now();
    let due = h.sync.due_pending_exits(now);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0, "005930");

    // Inside the backoff window nothing is due.
    assert!(h
        .sync
        .due_pending_exits(now + chrono::Duration::seconds(10))
        .is_empty());
    // After the backoff it comes due again.
    assert_eq!(
        h.sync
            .due_pending_exits(now + chrono::Duration::seconds(301))
            .len(),
        1
    );

    // The retry fills without duplicating anything, clearing the flag.
    h.broker.script_fill(ExecutionStatus::Filled, 10, 69_000.0);
    let result = h
        .sync
        .execute_sell(&sell("005930", 10, 69_000.0, "stop-r1", ExitReason::AtrStop))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Filled);
    assert!(!h.sync.has_pending_exit("005930"));

    let infos = h.notifier.kinds_at(Severity::Info);
    assert!(infos.contains(&"pending_exit_resolved".to_string()));

    let trades = TradeRepository::new(h.pool.clone(), MODE);
    assert_eq!(trades.get_by_symbol("005930").await.unwrap().len(), 1);
}
