use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::{Symbol, VenueId};

/// Hours in the canonical funding period all rates are normalized to.
pub const CANONICAL_INTERVAL_HOURS: u32 = 8;

/// One observation of a venue's funding rate for a symbol.
///
/// Produced by the external collection service and consumed read-only here.
/// `normalized_rate` is always `raw_rate * 8 / interval_hours`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRateSample {
    pub venue: VenueId,
    pub symbol: Symbol,
    /// Rate as quoted by the venue, per its own funding interval.
    pub raw_rate: Decimal,
    /// Rate re-expressed per canonical 8h period.
    pub normalized_rate: Decimal,
    /// Venue funding interval in hours (1, 4, 8, ...).
    pub interval_hours: u32,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
}

impl FundingRateSample {
    /// Build a sample, deriving the normalized rate from the raw quote.
    pub fn new(
        venue: VenueId,
        symbol: Symbol,
        raw_rate: Decimal,
        interval_hours: u32,
        next_funding_time: Option<DateTime<Utc>>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let interval = interval_hours.max(1);
        let normalized_rate =
            raw_rate * Decimal::from(CANONICAL_INTERVAL_HOURS) / Decimal::from(interval);
        FundingRateSample {
            venue,
            symbol,
            raw_rate,
            normalized_rate,
            interval_hours: interval,
            next_funding_time,
            observed_at,
        }
    }

    /// Sample age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.observed_at
    }
}

/// Latest funding sample for a (venue, symbol) plus the market stats the
/// opportunity filters need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub sample: FundingRateSample,
    pub volume_24h_usd: Decimal,
    pub open_interest_usd: Decimal,
}
