//! Strategy lifecycle scenarios: open on divergence, the three exit paths,
//! funding accumulation with restart replay, and reconciliation halts.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fundarb::config::ArbConfig;
use fundarb::exec::{AtomicExecutor, ExecutorConfig};
use fundarb::market::PriceCache;
use fundarb::model::{
    ExitReason, FundingRateSample, FundingSnapshot, OrderSide, Position, PositionLeg,
    PositionSide, PositionStatus, VenueId,
};
use fundarb::position::PositionManager;
use fundarb::store::{FundingRateStore, PositionStore, open_in_memory};
use fundarb::strategy::FundingArbStrategy;
use fundarb::venue::VenueClient;
use fundarb::venue::paper::PaperVenue;

use common::{btc, d, paper_venue, scenario_books};

struct Harness {
    v1: Arc<PaperVenue>,
    v2: Arc<PaperVenue>,
    store: PositionStore,
    positions: Arc<PositionManager>,
    rates: FundingRateStore,
    strategy: FundingArbStrategy,
}

fn test_config() -> ArbConfig {
    serde_json::from_value(serde_json::json!({
        "primary_venue": "v1",
        "whitelisted_venues": ["v1", "v2"],
        "target_exposure_per_side_usd": "1000",
        "max_total_exposure_usd": "10000",
        "min_net_profit_rate": "0.0005",
        "max_open_interest_usd": "50000000",
        "required_max_leverage": "5",
        "order_timeout_seconds": 2,
        "venues": {
            "v1": { "limit_offset_bps": "1", "taker_fee_bps": "1", "maker_fee_bps": "0.5" },
            "v2": { "limit_offset_bps": "1", "taker_fee_bps": "1", "maker_fee_bps": "0.5" }
        }
    }))
    .unwrap()
}

fn harness_with(dry_run: bool) -> Harness {
    let db = open_in_memory().unwrap();
    let store = PositionStore::new(db.clone());
    let positions = Arc::new(PositionManager::new(store.clone()));
    let rates = FundingRateStore::new(db);

    let v1 = paper_venue("v1", Some(20));
    let v2 = paper_venue("v2", Some(20));
    scenario_books(&v1, &v2);

    let executor = Arc::new(AtomicExecutor::new(
        Arc::new(PriceCache::new()),
        ExecutorConfig {
            poll_interval: Duration::from_millis(20),
            rollback_timeout: Duration::from_secs(2),
            dry_run,
            ..ExecutorConfig::default()
        },
    ));

    let mut clients: HashMap<VenueId, Arc<dyn VenueClient>> = HashMap::new();
    clients.insert(VenueId::new("v1"), v1.clone());
    clients.insert(VenueId::new("v2"), v2.clone());

    let strategy = FundingArbStrategy::new(
        test_config(),
        clients,
        executor,
        positions.clone(),
        rates.clone(),
    );

    Harness {
        v1,
        v2,
        store,
        positions,
        rates,
        strategy,
    }
}

fn harness() -> Harness {
    harness_with(false)
}

async fn seed_rates(rates: &FundingRateStore, v1_rate: &str, v2_rate: &str) {
    for (venue, rate) in [("v1", v1_rate), ("v2", v2_rate)] {
        rates
            .insert_sample(&FundingSnapshot {
                sample: FundingRateSample::new(
                    VenueId::new(venue),
                    btc(),
                    d(rate),
                    8,
                    None,
                    Utc::now(),
                ),
                volume_24h_usd: d("5000000"),
                open_interest_usd: d("20000000"),
            })
            .await
            .unwrap();
    }
}

async fn run_once(strategy: &FundingArbStrategy) {
    strategy
        .run(CancellationToken::new(), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn opens_pair_when_divergence_clears_fees() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;

    run_once(&h.strategy).await;

    let open = h.positions.list_open().await;
    assert_eq!(open.len(), 1);
    let position = &open[0];
    assert_eq!(position.entry_divergence, d("0.0014"));
    assert_eq!(position.long_leg.venue.as_str(), "v1");
    assert_eq!(position.short_leg.venue.as_str(), "v2");
    assert_eq!(position.status, PositionStatus::Open);

    // Live venue inventory matches the record, long against short.
    let long_qty = h.v1.position_quantity(&btc());
    let short_qty = h.v2.position_quantity(&btc());
    assert!(long_qty > Decimal::ZERO);
    assert!(short_qty < Decimal::ZERO);
    assert!((long_qty - short_qty.abs()).abs() <= d("0.0001"));
    assert_eq!(position.long_leg.quantity, long_qty);

    // Durable copy agrees.
    let stored = h.store.get(position.id).await.unwrap().unwrap();
    assert_eq!(stored.entry_divergence, d("0.0014"));
}

#[tokio::test]
async fn does_not_duplicate_an_existing_pair() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;

    run_once(&h.strategy).await;
    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;

    assert_eq!(h.positions.list_open().await.len(), 1);
}

#[tokio::test]
async fn divergence_flip_exits_urgently() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;
    let id = h.positions.list_open().await[0].id;

    // Rates cross: the pair now pays the wrong way.
    seed_rates(&h.rates, "0.0012", "0.0008").await;
    run_once(&h.strategy).await;

    let closed = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::DivergenceFlip));
    assert_eq!(closed.current_divergence, d("-0.0004"));
    assert!(closed.realized_pnl_usd.is_some());
    assert!(closed.closed_at.is_some());

    assert_eq!(h.v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(h.v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn erosion_exits_when_ratio_drops_below_half() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;
    let id = h.positions.list_open().await[0].id;

    // 0.0006 / 0.0014 = 0.43, under the 0.5 default threshold.
    seed_rates(&h.rates, "0.0001", "0.0007").await;
    run_once(&h.strategy).await;

    let closed = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::ProfitErosion));
    assert_eq!(h.v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(h.v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn age_exit_closes_old_but_still_paying_pairs() {
    let h = harness();

    // A positive but gently eroded divergence: only the age rule fires.
    seed_rates(&h.rates, "0.0001", "0.0005").await;

    let quantity = d("0.02");
    let now = Utc::now();
    let leg = |venue: &str, side: PositionSide, entry: &str| PositionLeg {
        venue: VenueId::new(venue),
        side,
        size_usd: d("1000"),
        quantity,
        entry_price: d(entry),
        entry_rate: d("0.0001"),
        fees_paid_usd: d("0.10"),
        slippage_paid_usd: Decimal::ZERO,
        leverage: Some(d("5")),
    };
    let position = Position {
        id: Uuid::new_v4(),
        strategy: "funding_arbitrage".to_string(),
        account_id: None,
        symbol: btc(),
        long_leg: leg("v1", PositionSide::Long, "50001"),
        short_leg: leg("v2", PositionSide::Short, "50004"),
        size_usd: d("1000"),
        entry_divergence: d("0.0005"),
        current_divergence: d("0.0005"),
        opened_at: now - chrono::Duration::hours(169),
        last_check_at: now,
        status: PositionStatus::Open,
        exit_reason: None,
        closed_at: None,
        cumulative_funding_usd: d("3.20"),
        total_fees_paid_usd: d("0.20"),
        realized_pnl_usd: None,
        needs_reconciliation: false,
    };
    h.store.insert(&position).await.unwrap();

    // Matching live inventory on the venues.
    h.v1.place_market(&btc(), OrderSide::Buy, quantity, false).await.unwrap();
    h.v2.place_market(&btc(), OrderSide::Sell, quantity, false).await.unwrap();

    run_once(&h.strategy).await;

    let closed = h.store.get(position.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::MaxAge));
    assert_eq!(h.v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(h.v2.position_quantity(&btc()), Decimal::ZERO);
}

#[tokio::test]
async fn funding_payments_accumulate_and_survive_restart() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;
    let id = h.positions.list_open().await[0].id;

    // The short venue credits one funding payment after the open.
    h.v2.push_funding_event(fundarb::venue::FundingEvent {
        symbol: btc(),
        funding_rate: d("0.0015"),
        amount_usd: d("1.87"),
        applied_at: Utc::now(),
    });

    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;

    let position = h.store.get(id).await.unwrap().unwrap();
    assert_eq!(position.cumulative_funding_usd, d("1.87"));

    let payments = h.store.payments_for(id).await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].venue.as_str(), "v2");

    // Restart: a fresh manager rebuilt from the database reproduces the
    // same totals from the append-only payment rows.
    let rebuilt = PositionManager::new(h.store.clone());
    rebuilt.load().await.unwrap();
    let reloaded = rebuilt.get(id).await.unwrap();
    let replayed: Decimal = payments.iter().map(|p| p.payment_amount_usd).sum();
    assert_eq!(reloaded.cumulative_funding_usd, replayed);
}

#[tokio::test]
async fn venue_mismatch_flags_position_and_halts_opens() {
    let h = harness();
    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;
    let id = h.positions.list_open().await[0].id;

    // Someone (or something) closed the long leg behind our back.
    let held = h.v1.position_quantity(&btc());
    h.v1.place_market(&btc(), OrderSide::Sell, held, true).await.unwrap();

    seed_rates(&h.rates, "0.0001", "0.0015").await;
    run_once(&h.strategy).await;

    let flagged = h.store.get(id).await.unwrap().unwrap();
    assert!(flagged.needs_reconciliation);
    // Not silently repaired or closed.
    assert_eq!(flagged.status, PositionStatus::Open);
    assert!(h.strategy.opens_halted());
    // And no new position was opened while halted.
    assert_eq!(h.positions.list_open().await.len(), 1);
}

#[tokio::test]
async fn dry_run_scans_without_placing() {
    let h = harness_with(true);
    seed_rates(&h.rates, "0.0001", "0.0015").await;

    run_once(&h.strategy).await;

    assert!(h.positions.list_open().await.is_empty());
    assert_eq!(h.v1.position_quantity(&btc()), Decimal::ZERO);
    assert_eq!(h.v2.position_quantity(&btc()), Decimal::ZERO);
}
