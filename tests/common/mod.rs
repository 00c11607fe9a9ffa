#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use fundarb::exec::{AtomicExecutor, ExecutorConfig};
use fundarb::market::PriceCache;
use fundarb::model::{DepthLevel, ExecutionMode, OrderSide, OrderSpec, Symbol};
use fundarb::venue::paper::{PaperVenue, PaperVenueConfig};

pub fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn btc() -> Symbol {
    Symbol::new("BTC")
}

/// Arithmetic ladder away from `start`: `step` is negative for bids.
pub fn book_side(start: &str, step: &str, levels: usize, size: &str) -> Vec<DepthLevel> {
    let start = d(start);
    let step = d(step);
    let size = d(size);
    (0..levels)
        .map(|i| DepthLevel {
            price: start + step * Decimal::from(i as u64),
            size,
        })
        .collect()
}

pub fn paper_venue(name: &str, passive_fill_ms: Option<u64>) -> Arc<PaperVenue> {
    let mut cfg = PaperVenueConfig::new(name);
    cfg.taker_jitter_bps = 0;
    cfg.passive_fill_delay = passive_fill_ms.map(Duration::from_millis);
    Arc::new(PaperVenue::new(cfg))
}

/// The spec's two-venue BTC setup: V1 quotes 49999/50001, V2 50004/50005,
/// twenty one-coin levels per side.
pub fn scenario_books(v1: &PaperVenue, v2: &PaperVenue) {
    v1.set_book(
        btc(),
        book_side("49999", "-1", 20, "1"),
        book_side("50001", "1", 20, "1"),
    );
    v2.set_book(
        btc(),
        book_side("50004", "-1", 20, "1"),
        book_side("50005", "1", 20, "1"),
    );
}

pub fn fast_executor() -> AtomicExecutor {
    AtomicExecutor::new(
        Arc::new(PriceCache::new()),
        ExecutorConfig {
            poll_interval: Duration::from_millis(20),
            rollback_timeout: Duration::from_secs(2),
            ..ExecutorConfig::default()
        },
    )
}

pub fn open_spec(
    venue: &Arc<PaperVenue>,
    side: OrderSide,
    size_usd: &str,
    mode: ExecutionMode,
    timeout: Duration,
) -> OrderSpec {
    OrderSpec {
        client: venue.clone(),
        symbol: btc(),
        side,
        size_usd: d(size_usd),
        quantity: None,
        mode,
        limit_offset_bps: Decimal::ONE,
        reduce_only: false,
        timeout,
    }
}
