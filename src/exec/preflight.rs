//! Feasibility pass run before any order is submitted.
//!
//! For each leg: fetch depth, require a two-sided book, walk the opposite
//! ladder against the requested notional, and refuse the whole invocation if
//! any leg cannot fill within the slippage budget. The snapshots fetched
//! here warm the shared price cache so order pricing does not pay a second
//! round-trip.

use rust_decimal::Decimal;

use crate::market::{PriceCache, PriceSource};
use crate::model::OrderSpec;

use super::ExecError;

pub(crate) async fn run(
    orders: &[OrderSpec],
    depth_levels: usize,
    max_slippage_bps: Decimal,
    cache: &PriceCache,
) -> Result<(), ExecError> {
    for spec in orders {
        let venue = spec.venue().clone();
        let snapshot = spec
            .client
            .fetch_depth(&spec.symbol, depth_levels)
            .await
            .map_err(|e| ExecError::QuoteUnavailable {
                venue: venue.clone(),
                symbol: spec.symbol.clone(),
                reason: e.to_string(),
            })?;

        let (Some(_bid), Some(ask)) = (snapshot.best_bid(), snapshot.best_ask()) else {
            return Err(ExecError::QuoteUnavailable {
                venue,
                symbol: spec.symbol.clone(),
                reason: "one-sided book".into(),
            });
        };

        // Close legs are sized in base units; convert with the touch so the
        // ladder walk sees a notional.
        let wanted_usd = match spec.quantity {
            Some(quantity) => quantity * ask,
            None => spec.size_usd,
        };

        let check = snapshot.check_liquidity(spec.side, wanted_usd);
        if !check.depth_sufficient {
            return Err(ExecError::InsufficientLiquidity {
                venue,
                symbol: spec.symbol.clone(),
                wanted: wanted_usd,
                available: check.available_usd,
            });
        }
        if check.est_slippage_bps > max_slippage_bps {
            return Err(ExecError::SlippageTooHigh {
                venue,
                symbol: spec.symbol.clone(),
                est_bps: check.est_slippage_bps,
                max_bps: max_slippage_bps,
            });
        }

        cache.cache_depth(&snapshot, PriceSource::LiquidityCheck);
    }
    Ok(())
}
