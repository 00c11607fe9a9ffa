pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::{DepthSnapshot, OrderSide, Symbol, VenueId};

/// Errors a venue client surfaces across the trading boundary.
///
/// Transient network conditions are retried inside the client; what escapes
/// here is already past retry and classified.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Venue unreachable after the client exhausted its retries.
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("unknown symbol '{0}'")]
    SymbolUnknown(String),

    /// Symbol exists but the requested facility (e.g. leverage) is not
    /// offered for it.
    #[error("symbol '{0}' not supported: {1}")]
    Unsupported(String, String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("post-only order would cross: {0}")]
    PostOnlyRejected(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    #[error("unknown order id '{0}'")]
    OrderUnknown(String),
}

impl VenueError {
    /// Whether the caller may expect a retry of the same call to succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Unavailable(_))
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Venue-side order state as reported by `get_order` / `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// Point-in-time view of one order.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub state: OrderState,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Live position on a venue. `quantity` is signed: positive long,
/// negative short, zero flat.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub leverage: Option<Decimal>,
}

impl VenuePosition {
    pub fn flat(symbol: Symbol) -> Self {
        VenuePosition {
            symbol,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            mark_price: Decimal::ZERO,
            leverage: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == Decimal::ZERO
    }
}

/// Leverage metadata for a listed symbol.
#[derive(Debug, Clone)]
pub struct LeverageInfo {
    pub max_leverage: Decimal,
    /// Initial margin requirement as a fraction of notional.
    pub margin_requirement: Decimal,
}

/// A funding credit or debit the venue applied to our account.
#[derive(Debug, Clone)]
pub struct FundingEvent {
    pub symbol: Symbol,
    pub funding_rate: Decimal,
    pub amount_usd: Decimal,
    pub applied_at: DateTime<Utc>,
}

/// Uniform trading contract over one (venue, account) binding.
///
/// Implementations own their wire protocol, retries and rate limiting; every
/// instance must be safe for concurrent use from multiple tasks. All prices
/// and sizes crossing this boundary are decimals, rounded by the caller to
/// `tick_size` / `size_step` before submission.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Stable identifier of this (venue, account) binding.
    fn venue(&self) -> &VenueId;

    /// Best bid and best ask.
    async fn fetch_bbo(&self, symbol: &Symbol) -> VenueResult<(Decimal, Decimal)>;

    /// Order book ladders, at most `levels` deep per side. Venues may clamp.
    async fn fetch_depth(&self, symbol: &Symbol, levels: usize) -> VenueResult<DepthSnapshot>;

    /// Place a resting limit order. Returns the venue order id on acceptance.
    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> VenueResult<String>;

    /// Place a market order; fills on acceptance.
    async fn place_market(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> VenueResult<String>;

    /// Cancel an order. Idempotent: cancelling an already-terminal order
    /// returns its terminal snapshot rather than an error, so callers can
    /// always reconcile the final filled quantity from the return value.
    async fn cancel(&self, order_id: &str) -> VenueResult<OrderSnapshot>;

    async fn get_order(&self, order_id: &str) -> VenueResult<OrderSnapshot>;

    /// Live position for the symbol; flat positions come back as zero,
    /// never as an error.
    async fn get_position(&self, symbol: &Symbol) -> VenueResult<VenuePosition>;

    /// Leverage metadata. A symbol the venue does not list must surface as
    /// `VenueError::Unsupported`, never as a silent zero.
    async fn get_leverage_info(&self, symbol: &Symbol) -> VenueResult<LeverageInfo>;

    /// Funding credits/debits applied to our account since `since`.
    async fn funding_events_since(
        &self,
        symbol: &Symbol,
        since: DateTime<Utc>,
    ) -> VenueResult<Vec<FundingEvent>>;

    /// Price granularity for the symbol.
    fn tick_size(&self, symbol: &Symbol) -> VenueResult<Decimal>;

    /// Size granularity for the symbol.
    fn size_step(&self, symbol: &Symbol) -> VenueResult<Decimal>;

    /// Map a venue-native contract identifier to the canonical symbol.
    fn normalize_symbol(&self, native: &str) -> VenueResult<Symbol>;

    /// Map a canonical symbol to the venue-native contract identifier.
    fn denormalize_symbol(&self, symbol: &Symbol) -> VenueResult<String>;
}

/// Round `quantity` down to the venue's size step.
pub fn round_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    (quantity / step).floor() * step
}

/// Round `price` to the venue's tick, toward the passive side of `side`
/// (down for buys, up for sells) so the rounded price never crosses further
/// than the caller priced.
pub fn round_to_tick(price: Decimal, tick: Decimal, side: OrderSide) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let ticks = price / tick;
    let rounded = match side {
        OrderSide::Buy => ticks.floor(),
        OrderSide::Sell => ticks.ceil(),
    };
    rounded * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn step_rounding_never_rounds_up() {
        assert_eq!(round_to_step(d("0.0299"), d("0.01")), d("0.02"));
        assert_eq!(round_to_step(d("0.03"), d("0.01")), d("0.03"));
        assert_eq!(round_to_step(d("5"), Decimal::ZERO), d("5"));
    }

    #[test]
    fn tick_rounding_respects_side() {
        assert_eq!(round_to_tick(d("100.07"), d("0.05"), OrderSide::Buy), d("100.05"));
        assert_eq!(round_to_tick(d("100.07"), d("0.05"), OrderSide::Sell), d("100.10"));
    }
}
