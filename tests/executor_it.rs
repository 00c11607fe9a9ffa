//! Atomic executor scenarios: both-fill, rollback, pre-flight refusal,
//! hedge escalation, and caller-driven cancellation.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use fundarb::exec::{ExecError, ExecIntent, ExecOptions};
use fundarb::model::{ExecutionMode, OrderSide};
use fundarb::venue::VenueError;

use common::{btc, book_side, d, fast_executor, open_spec, paper_venue, scenario_books};

#[tokio::test]
async fn happy_path_open_fills_both_legs_delta_neutral() {
    let v1 = paper_venue("v1", Some(20));
    let v2 = paper_venue("v2", Some(20));
    scenario_books(&v1, &v2);
    let executor = fast_executor();

    let timeout = Duration::from_secs(2);
    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "1000", ExecutionMode::LimitWithFallback, timeout),
        open_spec(&v2, OrderSide::Sell, "1000", ExecutionMode::LimitWithFallback, timeout),
    ];

    let result = executor
        .execute_atomically(orders, ExecOptions::open(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.all_filled);
    assert!(!result.rollback_performed);
    assert_eq!(result.filled_orders.len(), 2);

    // Delta neutrality: both legs filled the same base quantity within the
    // coarser venue's step.
    let long_qty = v1.position_quantity(&btc());
    let short_qty = v2.position_quantity(&btc());
    assert!(long_qty > Decimal::ZERO);
    assert!(short_qty < Decimal::ZERO);
    assert!((long_qty - short_qty.abs()).abs() <= d("0.0001"));

    // Passive fills near the touch cost almost nothing.
    assert!(result.total_slippage_usd <= d("0.50"));
}

#[tokio::test]
async fn rejected_leg_rolls_back_the_filled_sibling() {
    let v1 = paper_venue("v1", Some(5));
    let v2 = paper_venue("v2", Some(5));
    scenario_books(&v1, &v2);
    let executor = fast_executor();

    v2.inject_place_error(VenueError::InsufficientMargin("margin check failed".into()));

    let timeout = Duration::from_secs(2);
    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "1000", ExecutionMode::LimitWithFallback, timeout),
        open_spec(&v2, OrderSide::Sell, "1000", ExecutionMode::LimitWithFallback, timeout),
    ];

    let result = executor
        .execute_atomically(orders, ExecOptions::open(), &CancellationToken::new())
        .await
        .unwrap();

    // Successful rollback, not a success-at-opening.
    assert!(result.success);
    assert!(!result.all_filled);
    assert!(result.rollback_performed);
    assert_eq!(result.failed_orders.len(), 1);
    assert!(result.rollback_cost_usd >= Decimal::ZERO);
    // Compensation is bounded by a small fraction of the notional.
    assert!(result.rollback_cost_usd < d("10"));

    // Atomicity of the failed open: no net exposure anywhere.
    assert_eq!(v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn preflight_refuses_thin_book_without_placing() {
    let v1 = paper_venue("v1", Some(5));
    let v2 = paper_venue("v2", Some(5));
    v1.set_book(
        btc(),
        book_side("49999", "-1", 20, "1"),
        book_side("50001", "1", 20, "1"),
    );
    // V2 depth sums to roughly $3k a side, well under the requested $10k.
    v2.set_book(
        btc(),
        book_side("50004", "-1", 2, "0.03"),
        book_side("50005", "1", 2, "0.03"),
    );
    let executor = fast_executor();

    let timeout = Duration::from_secs(2);
    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "10000", ExecutionMode::LimitWithFallback, timeout),
        open_spec(&v2, OrderSide::Sell, "10000", ExecutionMode::LimitWithFallback, timeout),
    ];

    let err = executor
        .execute_atomically(orders, ExecOptions::open(), &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        ExecError::InsufficientLiquidity { venue, available, .. } => {
            assert_eq!(venue.as_str(), "v2");
            assert!(*available < d("10000"));
        }
        other => panic!("expected InsufficientLiquidity, got {other}"),
    }
    assert!(err.is_recoverable());

    // Nothing was placed on either venue.
    assert_eq!(v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn first_fill_escalates_the_resting_sibling() {
    // V2's limit would rest forever (no passive fills); the V1 market fill
    // must push it to market well before its own timeout.
    let v1 = paper_venue("v1", Some(5));
    let v2 = paper_venue("v2", None);
    scenario_books(&v1, &v2);
    let executor = fast_executor();

    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "1000", ExecutionMode::MarketOnly, Duration::from_secs(10)),
        open_spec(&v2, OrderSide::Sell, "1000", ExecutionMode::LimitWithFallback, Duration::from_secs(10)),
    ];

    let result = executor
        .execute_atomically(orders, ExecOptions::open(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.all_filled);
    // Escalation happened long before the 10s limit timeout.
    assert!(result.elapsed_ms < 5_000);
    assert!((v1.position_quantity(&btc()) + v2.position_quantity(&btc())).abs() <= d("0.0001"));
}

#[tokio::test]
async fn caller_cancellation_flattens_and_returns() {
    // Both legs rest with no passive fills; cancelling the invocation must
    // cancel the orders and report no exposure.
    let v1 = paper_venue("v1", None);
    let v2 = paper_venue("v2", None);
    scenario_books(&v1, &v2);
    let executor = fast_executor();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        canceller.cancel();
    });

    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "1000", ExecutionMode::LimitOnly, Duration::from_secs(30)),
        open_spec(&v2, OrderSide::Sell, "1000", ExecutionMode::LimitOnly, Duration::from_secs(30)),
    ];

    let result = executor
        .execute_atomically(orders, ExecOptions::open(), &cancel)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.all_filled);
    assert_eq!(v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn opening_without_rollback_is_rejected() {
    let v1 = paper_venue("v1", Some(5));
    let v2 = paper_venue("v2", Some(5));
    scenario_books(&v1, &v2);
    let executor = fast_executor();

    let timeout = Duration::from_secs(1);
    let orders = vec![
        open_spec(&v1, OrderSide::Buy, "1000", ExecutionMode::LimitWithFallback, timeout),
        open_spec(&v2, OrderSide::Sell, "1000", ExecutionMode::LimitWithFallback, timeout),
    ];

    let opts = ExecOptions {
        rollback_on_partial: false,
        pre_flight: true,
        intent: ExecIntent::Open,
    };
    let err = executor
        .execute_atomically(orders, opts, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::UnsafeFlag));
}

#[tokio::test]
async fn single_leg_invocations_are_refused() {
    let v1 = paper_venue("v1", Some(5));
    scenario_books(&v1, &paper_venue("v2", None));
    let executor = fast_executor();

    let orders = vec![open_spec(
        &v1,
        OrderSide::Buy,
        "1000",
        ExecutionMode::MarketOnly,
        Duration::from_secs(1),
    )];
    let err = executor
        .execute_atomically(orders, ExecOptions::open(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::TooFewLegs(1)));
}
