use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::venue::VenueClient;

use super::symbol::{Symbol, VenueId};

/// Taker direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a leg is worked on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One limit order; unfilled size is abandoned at timeout.
    LimitOnly,
    /// Limit order first; escalates to market at timeout or when a sibling
    /// leg confirms a fill.
    LimitWithFallback,
    /// Straight to market.
    MarketOnly,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::LimitOnly => "limit_only",
            ExecutionMode::LimitWithFallback => "limit_with_fallback",
            ExecutionMode::MarketOnly => "market_only",
        }
    }
}

/// One leg handed to the atomic executor.
///
/// Carries the venue client it must be worked against; the executor never
/// resolves venues itself.
#[derive(Clone)]
pub struct OrderSpec {
    pub client: Arc<dyn VenueClient>,
    pub symbol: Symbol,
    pub side: OrderSide,
    /// Requested notional per leg. Ignored when `quantity` is set.
    pub size_usd: Decimal,
    /// Exact base quantity override. The close path sets this to the live
    /// venue position size so reduce-only legs match it exactly.
    pub quantity: Option<Decimal>,
    pub mode: ExecutionMode,
    /// Offset from the touch in basis points. Positive rests inside the
    /// spread; negative crosses it.
    pub limit_offset_bps: Decimal,
    pub reduce_only: bool,
    pub timeout: Duration,
}

impl OrderSpec {
    pub fn venue(&self) -> &VenueId {
        self.client.venue()
    }
}

impl fmt::Debug for OrderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSpec")
            .field("venue", self.client.venue())
            .field("symbol", &self.symbol)
            .field("side", &self.side)
            .field("size_usd", &self.size_usd)
            .field("quantity", &self.quantity)
            .field("mode", &self.mode)
            .field("limit_offset_bps", &self.limit_offset_bps)
            .field("reduce_only", &self.reduce_only)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Terminal outcome of a single leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub success: bool,
    pub order_id: Option<String>,
    /// Base units actually filled (zero if nothing filled).
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Cost versus the reference mid at pricing time, in USD. Never negative.
    pub slippage_usd: Decimal,
    pub mode_used: ExecutionMode,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled_notional(&self) -> Decimal {
        match self.avg_fill_price {
            Some(px) => px * self.filled_quantity,
            None => Decimal::ZERO,
        }
    }

    pub fn has_fill(&self) -> bool {
        self.filled_quantity > Decimal::ZERO
    }
}

/// Aggregate outcome of one `execute_atomically` invocation.
///
/// `success=true, all_filled=false, rollback_performed=true` is the
/// "cleanly unwound" case: no net exposure remains, the caller should simply
/// move on. Hard failures (nothing placed, or rollback could not flatten)
/// are returned as errors, not as this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicExecutionResult {
    pub success: bool,
    pub all_filled: bool,
    pub filled_orders: Vec<OrderResult>,
    pub failed_orders: Vec<OrderResult>,
    pub rollback_performed: bool,
    /// Slippage paid by rollback compensators.
    pub rollback_cost_usd: Decimal,
    pub total_slippage_usd: Decimal,
    pub elapsed_ms: u64,
}

impl AtomicExecutionResult {
    /// Find the fill result for a given venue.
    pub fn fill_for(&self, venue: &VenueId) -> Option<&OrderResult> {
        self.filled_orders.iter().find(|r| &r.venue == venue)
    }
}
