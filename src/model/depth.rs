use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;
use super::symbol::{Symbol, VenueId};

/// One price level of an order book ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    /// Size in base units resting at this level.
    pub size: Decimal,
}

/// Order book snapshot as returned by a venue client.
///
/// Bids are sorted descending by price, asks ascending. The executor's
/// pre-flight walks these ladders to decide feasibility before any order
/// is placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of walking a ladder against a requested notional.
#[derive(Debug, Clone)]
pub struct LiquidityCheck {
    pub depth_sufficient: bool,
    /// Volume-weighted average price over the levels consumed.
    pub est_avg_price: Option<Decimal>,
    /// Estimated slippage versus top of book, in basis points.
    pub est_slippage_bps: Decimal,
    /// Notional actually available across the walked levels.
    pub available_usd: Decimal,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Walk the side a taker order of `side` would consume and report whether
    /// `size_usd` of notional can fill, at what average price, and at what
    /// slippage versus the touch.
    pub fn check_liquidity(&self, side: OrderSide, size_usd: Decimal) -> LiquidityCheck {
        let ladder = match side {
            OrderSide::Buy => &self.asks,
            OrderSide::Sell => &self.bids,
        };

        let Some(touch) = ladder.first().map(|l| l.price) else {
            return LiquidityCheck {
                depth_sufficient: false,
                est_avg_price: None,
                est_slippage_bps: Decimal::ZERO,
                available_usd: Decimal::ZERO,
            };
        };

        let mut remaining = size_usd;
        let mut filled_usd = Decimal::ZERO;
        let mut filled_base = Decimal::ZERO;

        for level in ladder {
            if remaining <= Decimal::ZERO {
                break;
            }
            let level_usd = level.price * level.size;
            let take_usd = level_usd.min(remaining);
            if level.price > Decimal::ZERO {
                filled_base += take_usd / level.price;
            }
            filled_usd += take_usd;
            remaining -= take_usd;
        }

        let depth_sufficient = remaining <= Decimal::ZERO && size_usd > Decimal::ZERO;
        let est_avg_price = if filled_base > Decimal::ZERO {
            Some(filled_usd / filled_base)
        } else {
            None
        };
        let est_slippage_bps = match est_avg_price {
            Some(avg) if touch > Decimal::ZERO => {
                ((avg - touch) / touch).abs() * Decimal::from(10_000)
            }
            _ => Decimal::ZERO,
        };

        LiquidityCheck {
            depth_sufficient,
            est_avg_price,
            est_slippage_bps,
            available_usd: filled_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn snapshot(asks: &[(&str, &str)], bids: &[(&str, &str)]) -> DepthSnapshot {
        let level = |(p, s): &(&str, &str)| DepthLevel { price: d(p), size: d(s) };
        DepthSnapshot {
            venue: VenueId::new("v1"),
            symbol: Symbol::new("BTC"),
            asks: asks.iter().map(level).collect(),
            bids: bids.iter().map(level).collect(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn sufficient_depth_reports_vwap_and_slippage() {
        let snap = snapshot(&[("100", "10"), ("101", "10")], &[("99", "10")]);
        // $1500 of buying: 10 @ 100, ~4.95 @ 101.
        let check = snap.check_liquidity(OrderSide::Buy, d("1500"));
        assert!(check.depth_sufficient);
        let avg = check.est_avg_price.unwrap();
        assert!(avg > d("100") && avg < d("101"));
        assert!(check.est_slippage_bps > Decimal::ZERO);
    }

    #[test]
    fn thin_book_is_refused() {
        let snap = snapshot(&[("100", "1")], &[("99", "1")]);
        let check = snap.check_liquidity(OrderSide::Buy, d("10000"));
        assert!(!check.depth_sufficient);
        assert_eq!(check.available_usd, d("100"));
    }

    #[test]
    fn empty_ladder_is_refused() {
        let snap = snapshot(&[], &[("99", "1")]);
        let check = snap.check_liquidity(OrderSide::Buy, d("100"));
        assert!(!check.depth_sufficient);
        assert!(check.est_avg_price.is_none());
    }
}
