use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::model::{DepthSnapshot, Symbol, VenueId};

/// Where a cached quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    /// Top of book captured during the executor's pre-flight depth fetch.
    LiquidityCheck,
    /// Direct BBO fetch.
    Direct,
}

/// One cached top-of-book entry.
#[derive(Debug, Clone)]
pub struct CachedPrice {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid: Decimal,
    pub observed_at: DateTime<Utc>,
    pub source: PriceSource,
}

/// Short-TTL best-bid/best-ask store keyed by (venue, symbol).
///
/// Pre-flight warms it from the depth snapshots it fetches anyway; order
/// pricing then reads it instead of issuing a second round-trip. Writes are
/// last-writer-wins per key, and every read sees a consistent entry.
#[derive(Default)]
pub struct PriceCache {
    entries: DashMap<(VenueId, Symbol), CachedPrice>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the top of book from a depth snapshot. Snapshots without both
    /// sides are ignored; a one-sided book is not a usable quote.
    pub fn cache_depth(&self, snapshot: &DepthSnapshot, source: PriceSource) {
        let (Some(bid), Some(ask)) = (snapshot.best_bid(), snapshot.best_ask()) else {
            return;
        };
        self.insert(CachedPrice {
            venue: snapshot.venue.clone(),
            symbol: snapshot.symbol.clone(),
            best_bid: bid,
            best_ask: ask,
            mid: (bid + ask) / Decimal::TWO,
            observed_at: snapshot.fetched_at,
            source,
        });
    }

    pub fn insert(&self, price: CachedPrice) {
        self.entries
            .insert((price.venue.clone(), price.symbol.clone()), price);
    }

    /// Cached (bid, ask) iff the entry is younger than `ttl`.
    pub fn get_bbo(&self, venue: &VenueId, symbol: &Symbol, ttl: Duration) -> Option<(Decimal, Decimal)> {
        self.get(venue, symbol, ttl).map(|p| (p.best_bid, p.best_ask))
    }

    /// Full cached entry iff younger than `ttl`.
    pub fn get(&self, venue: &VenueId, symbol: &Symbol, ttl: Duration) -> Option<CachedPrice> {
        let key = (venue.clone(), symbol.clone());
        let entry = self.entries.get(&key)?;
        let age = Utc::now() - entry.observed_at;
        if age.to_std().is_ok_and(|age| age < ttl) {
            Some(entry.clone())
        } else {
            None
        }
    }
}
