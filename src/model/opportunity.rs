use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::{Symbol, VenueId};

/// A ranked funding-rate divergence between two venues.
///
/// Derived by the opportunity finder, never persisted. The pair is oriented
/// so the short leg collects funding and the long leg pays:
/// `short_rate >= long_rate`, hence `divergence >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub symbol: Symbol,
    /// Venue on which the long leg is opened (lower funding rate).
    pub long_venue: VenueId,
    /// Venue on which the short leg is opened (higher funding rate).
    pub short_venue: VenueId,
    /// Normalized (per 8h) funding rate on the long venue.
    pub long_rate: Decimal,
    /// Normalized (per 8h) funding rate on the short venue.
    pub short_rate: Decimal,
    /// `short_rate - long_rate`.
    pub divergence: Decimal,
    /// Funding collected per canonical period per unit notional, before fees.
    pub gross_yield_per_period: Decimal,
    /// Estimated cost of opening both legs, in USD.
    pub entry_fees_usd: Decimal,
    /// Estimated cost of closing both legs, in USD.
    pub exit_fees_usd: Decimal,
    /// `divergence - (entry_fees + exit_fees) / notional`.
    pub net_profit_rate: Decimal,
    /// Lower of the two venues' 24h volume for the symbol.
    pub volume_24h_usd: Decimal,
    /// Lower of the two venues' open interest for the symbol.
    pub open_interest_usd: Decimal,
    /// Minimum of the two venues' maximum leverage for the symbol.
    pub max_leverage: Decimal,
    pub generated_at: DateTime<Utc>,
}

impl ArbitrageOpportunity {
    /// Key identifying the pair this opportunity would open.
    pub fn pair_key(&self) -> (Symbol, VenueId, VenueId) {
        (
            self.symbol.clone(),
            self.long_venue.clone(),
            self.short_venue.clone(),
        )
    }
}
