//! Opportunity finder: a pure ranking function over the latest funding-rate
//! snapshots. No side effects, no caching; the same snapshot set and filter
//! always produce the same ranked list.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::model::{ArbitrageOpportunity, FundingSnapshot, Symbol, VenueId};

use super::fees::FeeCalculator;

/// Filter applied to every candidate pair.
#[derive(Debug, Clone)]
pub struct OpportunityFilter {
    /// Minimum profit per period net of estimated round-trip fees.
    pub min_net_profit_rate: Decimal,
    /// Upper bound on either venue's open interest for the symbol.
    pub max_open_interest_usd: Decimal,
    /// Lower bound on either venue's 24h volume for the symbol.
    pub min_volume_24h_usd: Decimal,
    /// Both venues must offer at least this much leverage for the symbol.
    pub required_max_leverage: Decimal,
    /// Samples older than this are ignored.
    pub max_sample_age: Duration,
    /// Keep the top N by net profit rate.
    pub limit: usize,
}

/// Max leverage per (venue, symbol), prefetched by the caller from the venue
/// clients. A missing entry means the symbol is not tradable there.
pub type LeverageBook = HashMap<(VenueId, Symbol), Decimal>;

/// Scan the snapshots for divergent venue pairs and rank survivors by net
/// profit rate, descending. Ties break on (symbol, long venue, short venue)
/// so the ranking is total and deterministic.
pub fn find_opportunities(
    snapshots: &[FundingSnapshot],
    leverage: &LeverageBook,
    fees: &FeeCalculator,
    notional_per_side: Decimal,
    filter: &OpportunityFilter,
    now: DateTime<Utc>,
) -> Vec<ArbitrageOpportunity> {
    let mut by_symbol: HashMap<&Symbol, Vec<&FundingSnapshot>> = HashMap::new();
    for snapshot in snapshots {
        if snapshot.sample.age(now) > filter.max_sample_age {
            continue;
        }
        by_symbol
            .entry(&snapshot.sample.symbol)
            .or_default()
            .push(snapshot);
    }

    let mut candidates = Vec::new();
    for (&symbol, venue_snaps) in &by_symbol {
        for (i, a) in venue_snaps.iter().enumerate() {
            for b in venue_snaps.iter().skip(i + 1) {
                if a.sample.venue == b.sample.venue {
                    continue;
                }
                // Orient the pair: short the higher rate, long the lower.
                let (long, short) = if a.sample.normalized_rate <= b.sample.normalized_rate {
                    (*a, *b)
                } else {
                    (*b, *a)
                };
                if let Some(opportunity) =
                    build_candidate(symbol, long, short, leverage, fees, notional_per_side, filter, now)
                {
                    candidates.push(opportunity);
                }
            }
        }
    }

    candidates.sort_by(|x, y| {
        y.net_profit_rate
            .cmp(&x.net_profit_rate)
            .then_with(|| x.symbol.cmp(&y.symbol))
            .then_with(|| x.long_venue.cmp(&y.long_venue))
            .then_with(|| x.short_venue.cmp(&y.short_venue))
    });
    candidates.truncate(filter.limit);
    candidates
}

#[allow(clippy::too_many_arguments)]
fn build_candidate(
    symbol: &Symbol,
    long: &FundingSnapshot,
    short: &FundingSnapshot,
    leverage: &LeverageBook,
    fees: &FeeCalculator,
    notional_per_side: Decimal,
    filter: &OpportunityFilter,
    now: DateTime<Utc>,
) -> Option<ArbitrageOpportunity> {
    let long_rate = long.sample.normalized_rate;
    let short_rate = short.sample.normalized_rate;
    let divergence = short_rate - long_rate;
    // A non-positive divergence never pays, whatever the profit filter says.
    if divergence <= Decimal::ZERO {
        return None;
    }

    let volume = long.volume_24h_usd.min(short.volume_24h_usd);
    if volume < filter.min_volume_24h_usd {
        return None;
    }
    let open_interest = long.open_interest_usd.min(short.open_interest_usd);
    if long.open_interest_usd > filter.max_open_interest_usd
        || short.open_interest_usd > filter.max_open_interest_usd
    {
        return None;
    }

    let long_leverage = leverage.get(&(long.sample.venue.clone(), symbol.clone()))?;
    let short_leverage = leverage.get(&(short.sample.venue.clone(), symbol.clone()))?;
    let max_leverage = (*long_leverage).min(*short_leverage);
    if max_leverage < filter.required_max_leverage {
        return None;
    }

    if notional_per_side <= Decimal::ZERO {
        return None;
    }
    let entry_fees = fees.entry_fees_usd(&long.sample.venue, &short.sample.venue, notional_per_side);
    let exit_fees = fees.exit_fees_usd(&long.sample.venue, &short.sample.venue, notional_per_side);
    let net_profit_rate = divergence - (entry_fees + exit_fees) / notional_per_side;
    if net_profit_rate < filter.min_net_profit_rate {
        return None;
    }

    Some(ArbitrageOpportunity {
        symbol: symbol.clone(),
        long_venue: long.sample.venue.clone(),
        short_venue: short.sample.venue.clone(),
        long_rate,
        short_rate,
        divergence,
        gross_yield_per_period: divergence,
        entry_fees_usd: entry_fees,
        exit_fees_usd: exit_fees,
        net_profit_rate,
        volume_24h_usd: volume,
        open_interest_usd: open_interest,
        max_leverage,
        generated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FundingRateSample;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn snap(venue: &str, symbol: &str, rate: &str) -> FundingSnapshot {
        FundingSnapshot {
            sample: FundingRateSample::new(
                VenueId::new(venue),
                Symbol::new(symbol),
                d(rate),
                8,
                None,
                Utc::now(),
            ),
            volume_24h_usd: d("5000000"),
            open_interest_usd: d("20000000"),
        }
    }

    fn leverage_for(entries: &[(&str, &str)]) -> LeverageBook {
        entries
            .iter()
            .map(|(v, s)| ((VenueId::new(v), Symbol::new(s)), d("20")))
            .collect()
    }

    fn filter() -> OpportunityFilter {
        OpportunityFilter {
            min_net_profit_rate: d("0.0005"),
            max_open_interest_usd: d("100000000"),
            min_volume_24h_usd: d("1000000"),
            required_max_leverage: d("5"),
            max_sample_age: Duration::minutes(15),
            limit: 10,
        }
    }

    #[test]
    fn orients_pair_short_collects() {
        let snaps = vec![snap("v1", "BTC", "0.0001"), snap("v2", "BTC", "0.0015")];
        let found = find_opportunities(
            &snaps,
            &leverage_for(&[("v1", "BTC"), ("v2", "BTC")]),
            &FeeCalculator::default(),
            d("1000"),
            &filter(),
            Utc::now(),
        );
        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.long_venue.as_str(), "v1");
        assert_eq!(opp.short_venue.as_str(), "v2");
        assert_eq!(opp.divergence, d("0.0014"));
        assert!(opp.short_rate >= opp.long_rate);
    }

    #[test]
    fn non_positive_divergence_is_dropped_even_with_zero_floor() {
        let snaps = vec![snap("v1", "BTC", "0.0010"), snap("v2", "BTC", "0.0010")];
        let mut f = filter();
        f.min_net_profit_rate = Decimal::ZERO;
        // Equal rates: divergence is zero, fees would make it negative anyway.
        let found = find_opportunities(
            &snaps,
            &leverage_for(&[("v1", "BTC"), ("v2", "BTC")]),
            &FeeCalculator::default(),
            d("1000"),
            &f,
            Utc::now(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn stale_samples_are_ignored() {
        let mut old = snap("v1", "BTC", "0.0001");
        old.sample.observed_at = Utc::now() - Duration::hours(2);
        let snaps = vec![old, snap("v2", "BTC", "0.0015")];
        let found = find_opportunities(
            &snaps,
            &leverage_for(&[("v1", "BTC"), ("v2", "BTC")]),
            &FeeCalculator::default(),
            d("1000"),
            &filter(),
            Utc::now(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn missing_leverage_entry_drops_candidate() {
        let snaps = vec![snap("v1", "BTC", "0.0001"), snap("v2", "BTC", "0.0015")];
        let found = find_opportunities(
            &snaps,
            &leverage_for(&[("v1", "BTC")]),
            &FeeCalculator::default(),
            d("1000"),
            &filter(),
            Utc::now(),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn ranking_is_deterministic_and_descending() {
        let snaps = vec![
            snap("v1", "BTC", "0.0001"),
            snap("v2", "BTC", "0.0015"),
            snap("v1", "ETH", "0.0000"),
            snap("v2", "ETH", "0.0020"),
        ];
        let book = leverage_for(&[("v1", "BTC"), ("v2", "BTC"), ("v1", "ETH"), ("v2", "ETH")]);
        let now = Utc::now();
        let first = find_opportunities(&snaps, &book, &FeeCalculator::default(), d("1000"), &filter(), now);
        let second = find_opportunities(&snaps, &book, &FeeCalculator::default(), d("1000"), &filter(), now);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].symbol, Symbol::new("ETH"));
        assert!(first[0].net_profit_rate >= first[1].net_profit_rate);
        let key = |o: &ArbitrageOpportunity| {
            (o.symbol.clone(), o.long_venue.clone(), o.short_venue.clone())
        };
        assert_eq!(first.iter().map(key).collect::<Vec<_>>(), second.iter().map(key).collect::<Vec<_>>());
    }

    #[test]
    fn oi_cap_drops_oversized_markets() {
        let mut big = snap("v2", "BTC", "0.0015");
        big.open_interest_usd = d("200000000");
        let snaps = vec![snap("v1", "BTC", "0.0001"), big];
        let found = find_opportunities(
            &snaps,
            &leverage_for(&[("v1", "BTC"), ("v2", "BTC")]),
            &FeeCalculator::default(),
            d("1000"),
            &filter(),
            Utc::now(),
        );
        assert!(found.is_empty());
    }
}
