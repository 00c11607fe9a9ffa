use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::model::VenueId;

/// Per-venue fee schedule in basis points of notional.
#[derive(Debug, Clone)]
pub struct VenueFees {
    pub taker_bps: Decimal,
    pub maker_bps: Decimal,
}

impl Default for VenueFees {
    fn default() -> Self {
        VenueFees {
            taker_bps: Decimal::from(5),
            maker_bps: Decimal::from(2),
        }
    }
}

/// Estimates round-trip costs for a venue pair.
///
/// Estimates use taker fees on both legs. Entries usually rest as limits and
/// do better, so the net-profit filter errs conservative.
#[derive(Debug, Clone, Default)]
pub struct FeeCalculator {
    by_venue: HashMap<VenueId, VenueFees>,
    fallback: VenueFees,
}

impl FeeCalculator {
    pub fn new(by_venue: HashMap<VenueId, VenueFees>) -> Self {
        FeeCalculator {
            by_venue,
            fallback: VenueFees::default(),
        }
    }

    pub fn fees_for(&self, venue: &VenueId) -> &VenueFees {
        self.by_venue.get(venue).unwrap_or(&self.fallback)
    }

    /// Cost of one taker fill of `notional` on `venue`.
    pub fn taker_fee_usd(&self, venue: &VenueId, notional: Decimal) -> Decimal {
        notional * self.fees_for(venue).taker_bps / Decimal::from(10_000)
    }

    /// Cost of opening both legs at `notional` per side.
    pub fn entry_fees_usd(
        &self,
        long_venue: &VenueId,
        short_venue: &VenueId,
        notional_per_side: Decimal,
    ) -> Decimal {
        self.taker_fee_usd(long_venue, notional_per_side)
            + self.taker_fee_usd(short_venue, notional_per_side)
    }

    /// Cost of closing both legs at `notional` per side.
    pub fn exit_fees_usd(
        &self,
        long_venue: &VenueId,
        short_venue: &VenueId,
        notional_per_side: Decimal,
    ) -> Decimal {
        self.entry_fees_usd(long_venue, short_venue, notional_per_side)
    }
}
