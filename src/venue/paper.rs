//! In-memory venue used for dry runs and tests.
//!
//! Fills deterministically from a seeded order book with bounded random
//! taker slippage, tracks one signed position per symbol, and honors the
//! idempotent-cancel and reduce-only semantics real clients must provide.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::prelude::Signed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::model::{DepthLevel, DepthSnapshot, OrderSide, Symbol, VenueId};

use super::{
    FundingEvent, LeverageInfo, OrderSnapshot, OrderState, VenueClient, VenueError, VenuePosition,
    VenueResult,
};

#[derive(Debug, Clone)]
pub struct PaperVenueConfig {
    pub venue: VenueId,
    pub tick_size: Decimal,
    pub size_step: Decimal,
    pub max_leverage: Decimal,
    /// Upper bound on random taker slippage, in basis points.
    pub taker_jitter_bps: u32,
    /// How long a resting limit order takes to fill passively.
    /// `None` means resting orders never fill on their own.
    pub passive_fill_delay: Option<Duration>,
    pub seed: u64,
}

impl PaperVenueConfig {
    pub fn new(venue: impl Into<VenueId>) -> Self {
        PaperVenueConfig {
            venue: venue.into(),
            tick_size: Decimal::new(1, 2),  // 0.01
            size_step: Decimal::new(1, 4),  // 0.0001
            max_leverage: Decimal::from(20),
            taker_jitter_bps: 1,
            passive_fill_delay: Some(Duration::from_millis(50)),
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
struct Book {
    bids: Vec<DepthLevel>,
    asks: Vec<DepthLevel>,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: Symbol,
    side: OrderSide,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    reduce_only: bool,
    state: OrderState,
    filled_quantity: Decimal,
    avg_fill_price: Option<Decimal>,
    placed_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct PaperPosition {
    quantity: Decimal,
    entry_price: Decimal,
}

#[derive(Default)]
struct Inner {
    books: HashMap<Symbol, Book>,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<Symbol, PaperPosition>,
    funding: Vec<FundingEvent>,
    next_place_error: Option<VenueError>,
    next_order_id: u64,
}

pub struct PaperVenue {
    cfg: PaperVenueConfig,
    inner: Mutex<Inner>,
    rng: Mutex<StdRng>,
}

impl PaperVenue {
    pub fn new(cfg: PaperVenueConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        PaperVenue {
            cfg,
            inner: Mutex::new(Inner::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Seed a symmetric book around `mid`: `levels` price levels per side,
    /// `level_size` base units each, spaced one tick apart starting half a
    /// spread from the mid.
    pub fn seed_book(
        &self,
        symbol: Symbol,
        mid: Decimal,
        spread_bps: Decimal,
        levels: usize,
        level_size: Decimal,
    ) {
        let half_spread = mid * spread_bps / Decimal::from(20_000);
        let tick = self.cfg.tick_size;
        let mut bids = Vec::with_capacity(levels);
        let mut asks = Vec::with_capacity(levels);
        for i in 0..levels {
            let offset = tick * Decimal::from(i as u64);
            bids.push(DepthLevel {
                price: mid - half_spread - offset,
                size: level_size,
            });
            asks.push(DepthLevel {
                price: mid + half_spread + offset,
                size: level_size,
            });
        }
        self.inner.lock().books.insert(symbol, Book { bids, asks });
    }

    /// Replace a book with explicit ladders.
    pub fn set_book(&self, symbol: Symbol, bids: Vec<DepthLevel>, asks: Vec<DepthLevel>) {
        self.inner.lock().books.insert(symbol, Book { bids, asks });
    }

    /// Make the next `place_limit` / `place_market` call fail with `err`.
    pub fn inject_place_error(&self, err: VenueError) {
        self.inner.lock().next_place_error = Some(err);
    }

    /// Record a funding credit/debit for later `funding_events_since` calls.
    pub fn push_funding_event(&self, event: FundingEvent) {
        self.inner.lock().funding.push(event);
    }

    /// Current signed position quantity for a symbol (test hook).
    pub fn position_quantity(&self, symbol: &Symbol) -> Decimal {
        self.inner
            .lock()
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    fn jitter_bps(&self) -> Decimal {
        if self.cfg.taker_jitter_bps == 0 {
            return Decimal::ZERO;
        }
        let bps: u32 = self.rng.lock().random_range(0..=self.cfg.taker_jitter_bps);
        Decimal::from(bps) / Decimal::from(10_000)
    }

    /// Volume-weighted taker fill over the opposite ladder, worsened by the
    /// random jitter. Returns (avg_price, filled_quantity).
    fn taker_fill(
        book: &Book,
        side: OrderSide,
        quantity: Decimal,
        jitter: Decimal,
        limit: Option<Decimal>,
    ) -> Option<(Decimal, Decimal)> {
        let ladder = match side {
            OrderSide::Buy => &book.asks,
            OrderSide::Sell => &book.bids,
        };
        let mut remaining = quantity;
        let mut cost = Decimal::ZERO;
        let mut filled = Decimal::ZERO;
        for level in ladder {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = level.size.min(remaining);
            cost += take * level.price;
            filled += take;
            remaining -= take;
        }
        if filled <= Decimal::ZERO {
            return None;
        }
        let mut avg = cost / filled;
        avg = match side {
            OrderSide::Buy => avg * (Decimal::ONE + jitter),
            OrderSide::Sell => avg * (Decimal::ONE - jitter),
        };
        if let Some(limit_px) = limit {
            // A crossing limit never fills worse than its own price.
            avg = match side {
                OrderSide::Buy => avg.min(limit_px),
                OrderSide::Sell => avg.max(limit_px),
            };
        }
        Some((avg, filled))
    }

    fn apply_fill(
        positions: &mut HashMap<Symbol, PaperPosition>,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let pos = positions.entry(symbol.clone()).or_default();
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        let old = pos.quantity;
        let new = old + signed;
        if old.is_zero() || (old.is_sign_positive() == new.is_sign_positive() && !new.is_zero()) {
            let old_notional = old.abs() * pos.entry_price;
            let add_notional = quantity * price;
            if !new.is_zero() && (old.is_zero() || old.signum() == signed.signum()) {
                pos.entry_price = (old_notional + add_notional) / new.abs();
            }
        }
        pos.quantity = new;
        if pos.quantity.is_zero() {
            pos.entry_price = Decimal::ZERO;
        }
    }

    /// Reduce-only orders may only shrink the position; clamp and reject
    /// the ones that could not reduce anything.
    fn clamp_reduce_only(
        positions: &HashMap<Symbol, PaperPosition>,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
    ) -> VenueResult<Decimal> {
        let held = positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        let reducible = match side {
            OrderSide::Sell if held > Decimal::ZERO => held,
            OrderSide::Buy if held < Decimal::ZERO => -held,
            _ => Decimal::ZERO,
        };
        if reducible <= Decimal::ZERO {
            return Err(VenueError::Rejected(format!(
                "reduce-only {side} on {symbol} with no reducible position"
            )));
        }
        Ok(quantity.min(reducible))
    }

    fn passive_fill_due(&self, order: &PaperOrder) -> bool {
        match self.cfg.passive_fill_delay {
            Some(delay) => order.placed_at.elapsed() >= delay,
            None => false,
        }
    }

    /// Settle a resting order that has waited out the passive-fill delay.
    fn settle_if_due(&self, inner: &mut Inner, order_id: &str) {
        let due = match inner.orders.get(order_id) {
            Some(o) if o.state == OrderState::Open && self.passive_fill_due(o) => (
                o.symbol.clone(),
                o.side,
                o.quantity,
                o.limit_price.unwrap_or(Decimal::ZERO),
                o.reduce_only,
            ),
            _ => return,
        };
        let (symbol, side, mut quantity, price, reduce_only) = due;
        if reduce_only {
            // The position may have shrunk since placement; re-clamp.
            match Self::clamp_reduce_only(&inner.positions, &symbol, side, quantity) {
                Ok(clamped) => quantity = clamped,
                Err(_) => {
                    if let Some(order) = inner.orders.get_mut(order_id) {
                        order.state = OrderState::Canceled;
                    }
                    return;
                }
            }
        }
        Self::apply_fill(&mut inner.positions, &symbol, side, quantity, price);
        if let Some(order) = inner.orders.get_mut(order_id) {
            order.state = OrderState::Filled;
            order.filled_quantity = quantity;
            order.avg_fill_price = Some(price);
        }
    }

    fn book_mid(book: &Book) -> Option<Decimal> {
        match (book.bids.first(), book.asks.first()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / Decimal::TWO),
            _ => None,
        }
    }

    fn take_place_error(inner: &mut Inner) -> VenueResult<()> {
        match inner.next_place_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(inner: &mut Inner, prefix: &str) -> String {
        inner.next_order_id += 1;
        format!("{prefix}-{}", inner.next_order_id)
    }
}

#[async_trait]
impl VenueClient for PaperVenue {
    fn venue(&self) -> &VenueId {
        &self.cfg.venue
    }

    async fn fetch_bbo(&self, symbol: &Symbol) -> VenueResult<(Decimal, Decimal)> {
        let inner = self.inner.lock();
        let book = inner
            .books
            .get(symbol)
            .ok_or_else(|| VenueError::SymbolUnknown(symbol.to_string()))?;
        match (book.bids.first(), book.asks.first()) {
            (Some(b), Some(a)) => Ok((b.price, a.price)),
            _ => Err(VenueError::Unavailable(format!("empty book for {symbol}"))),
        }
    }

    async fn fetch_depth(&self, symbol: &Symbol, levels: usize) -> VenueResult<DepthSnapshot> {
        let inner = self.inner.lock();
        let book = inner
            .books
            .get(symbol)
            .ok_or_else(|| VenueError::SymbolUnknown(symbol.to_string()))?;
        Ok(DepthSnapshot {
            venue: self.cfg.venue.clone(),
            symbol: symbol.clone(),
            bids: book.bids.iter().take(levels).cloned().collect(),
            asks: book.asks.iter().take(levels).cloned().collect(),
            fetched_at: Utc::now(),
        })
    }

    async fn place_limit(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> VenueResult<String> {
        let jitter = self.jitter_bps();
        let mut inner = self.inner.lock();
        Self::take_place_error(&mut inner)?;
        let book = inner
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::SymbolUnknown(symbol.to_string()))?;

        let quantity = if reduce_only {
            Self::clamp_reduce_only(&inner.positions, symbol, side, quantity)?
        } else {
            quantity
        };

        let crosses = match side {
            OrderSide::Buy => book.asks.first().is_some_and(|a| price >= a.price),
            OrderSide::Sell => book.bids.first().is_some_and(|b| price <= b.price),
        };

        let order_id = Self::next_id(&mut inner, "lim");
        let mut order = PaperOrder {
            symbol: symbol.clone(),
            side,
            quantity,
            limit_price: Some(price),
            reduce_only,
            state: OrderState::Open,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            placed_at: Instant::now(),
        };

        if crosses {
            if let Some((avg, filled)) = Self::taker_fill(&book, side, quantity, jitter, Some(price))
            {
                Self::apply_fill(&mut inner.positions, symbol, side, filled, avg);
                order.filled_quantity = filled;
                order.avg_fill_price = Some(avg);
                order.state = if filled >= quantity {
                    OrderState::Filled
                } else {
                    OrderState::PartiallyFilled
                };
            }
        }

        inner.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn place_market(
        &self,
        symbol: &Symbol,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> VenueResult<String> {
        let jitter = self.jitter_bps();
        let mut inner = self.inner.lock();
        Self::take_place_error(&mut inner)?;
        let book = inner
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| VenueError::SymbolUnknown(symbol.to_string()))?;

        let quantity = if reduce_only {
            Self::clamp_reduce_only(&inner.positions, symbol, side, quantity)?
        } else {
            quantity
        };

        let (avg, filled) = Self::taker_fill(&book, side, quantity, jitter, None)
            .ok_or_else(|| VenueError::Rejected(format!("no liquidity for {symbol}")))?;
        Self::apply_fill(&mut inner.positions, symbol, side, filled, avg);

        let order_id = Self::next_id(&mut inner, "mkt");
        inner.orders.insert(
            order_id.clone(),
            PaperOrder {
                symbol: symbol.clone(),
                side,
                quantity,
                limit_price: None,
                reduce_only,
                state: OrderState::Filled,
                filled_quantity: filled,
                avg_fill_price: Some(avg),
                placed_at: Instant::now(),
            },
        );
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &str) -> VenueResult<OrderSnapshot> {
        let mut inner = self.inner.lock();
        self.settle_if_due(&mut inner, order_id);
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| VenueError::OrderUnknown(order_id.to_string()))?;
        if order.state == OrderState::Open || order.state == OrderState::PartiallyFilled {
            order.state = OrderState::Canceled;
        }
        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            state: order.state,
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn get_order(&self, order_id: &str) -> VenueResult<OrderSnapshot> {
        let mut inner = self.inner.lock();
        self.settle_if_due(&mut inner, order_id);
        let order = inner
            .orders
            .get(order_id)
            .ok_or_else(|| VenueError::OrderUnknown(order_id.to_string()))?;
        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            state: order.state,
            filled_quantity: order.filled_quantity,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn get_position(&self, symbol: &Symbol) -> VenueResult<VenuePosition> {
        let inner = self.inner.lock();
        let mark = inner
            .books
            .get(symbol)
            .and_then(Self::book_mid)
            .unwrap_or(Decimal::ZERO);
        match inner.positions.get(symbol) {
            Some(pos) if !pos.quantity.is_zero() => Ok(VenuePosition {
                symbol: symbol.clone(),
                quantity: pos.quantity,
                entry_price: pos.entry_price,
                mark_price: mark,
                leverage: Some(Decimal::ONE),
            }),
            _ => Ok(VenuePosition::flat(symbol.clone())),
        }
    }

    async fn get_leverage_info(&self, symbol: &Symbol) -> VenueResult<LeverageInfo> {
        let inner = self.inner.lock();
        if !inner.books.contains_key(symbol) {
            return Err(VenueError::Unsupported(
                symbol.to_string(),
                "not listed on paper venue".into(),
            ));
        }
        Ok(LeverageInfo {
            max_leverage: self.cfg.max_leverage,
            margin_requirement: Decimal::ONE / self.cfg.max_leverage,
        })
    }

    async fn funding_events_since(
        &self,
        symbol: &Symbol,
        since: DateTime<Utc>,
    ) -> VenueResult<Vec<FundingEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .funding
            .iter()
            .filter(|e| &e.symbol == symbol && e.applied_at > since)
            .cloned()
            .collect())
    }

    fn tick_size(&self, _symbol: &Symbol) -> VenueResult<Decimal> {
        Ok(self.cfg.tick_size)
    }

    fn size_step(&self, _symbol: &Symbol) -> VenueResult<Decimal> {
        Ok(self.cfg.size_step)
    }

    fn normalize_symbol(&self, native: &str) -> VenueResult<Symbol> {
        match native.strip_suffix("-PERP") {
            Some(base) if !base.is_empty() => Ok(Symbol::new(base)),
            _ => Err(VenueError::SymbolUnknown(native.to_string())),
        }
    }

    fn denormalize_symbol(&self, symbol: &Symbol) -> VenueResult<String> {
        Ok(format!("{symbol}-PERP"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn venue() -> PaperVenue {
        let mut cfg = PaperVenueConfig::new("paper-a");
        cfg.taker_jitter_bps = 0;
        let v = PaperVenue::new(cfg);
        v.seed_book(Symbol::new("BTC"), d("50000"), d("2"), 20, d("1"));
        v
    }

    #[tokio::test]
    async fn market_order_fills_and_moves_position() {
        let v = venue();
        let btc = Symbol::new("BTC");
        let id = v
            .place_market(&btc, OrderSide::Buy, d("0.5"), false)
            .await
            .unwrap();
        let snap = v.get_order(&id).await.unwrap();
        assert_eq!(snap.state, OrderState::Filled);
        assert_eq!(snap.filled_quantity, d("0.5"));
        assert_eq!(v.position_quantity(&btc), d("0.5"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_orders() {
        let v = venue();
        let btc = Symbol::new("BTC");
        let id = v
            .place_market(&btc, OrderSide::Buy, d("0.5"), false)
            .await
            .unwrap();
        let first = v.cancel(&id).await.unwrap();
        assert_eq!(first.state, OrderState::Filled);
        let second = v.cancel(&id).await.unwrap();
        assert_eq!(second.state, OrderState::Filled);
        assert_eq!(second.filled_quantity, d("0.5"));
    }

    #[tokio::test]
    async fn reduce_only_requires_a_position() {
        let v = venue();
        let btc = Symbol::new("BTC");
        let err = v
            .place_market(&btc, OrderSide::Sell, d("0.5"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::Rejected(_)));
    }

    #[tokio::test]
    async fn reduce_only_clamps_to_held_quantity() {
        let v = venue();
        let btc = Symbol::new("BTC");
        v.place_market(&btc, OrderSide::Buy, d("0.3"), false)
            .await
            .unwrap();
        let id = v
            .place_market(&btc, OrderSide::Sell, d("1.0"), true)
            .await
            .unwrap();
        let snap = v.get_order(&id).await.unwrap();
        assert_eq!(snap.filled_quantity, d("0.3"));
        assert_eq!(v.position_quantity(&btc), Decimal::ZERO);
    }

    #[tokio::test]
    async fn resting_limit_fills_after_delay() {
        let mut cfg = PaperVenueConfig::new("paper-a");
        cfg.taker_jitter_bps = 0;
        cfg.passive_fill_delay = Some(Duration::from_millis(5));
        let v = PaperVenue::new(cfg);
        let btc = Symbol::new("BTC");
        v.seed_book(btc.clone(), d("50000"), d("2"), 20, d("1"));

        // A buy below the ask rests.
        let id = v
            .place_limit(&btc, OrderSide::Buy, d("0.1"), d("49990"), false)
            .await
            .unwrap();
        assert_eq!(v.get_order(&id).await.unwrap().state, OrderState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let snap = v.get_order(&id).await.unwrap();
        assert_eq!(snap.state, OrderState::Filled);
        assert_eq!(snap.avg_fill_price, Some(d("49990")));
    }

    #[tokio::test]
    async fn injected_error_fails_exactly_once() {
        let v = venue();
        let btc = Symbol::new("BTC");
        v.inject_place_error(VenueError::InsufficientMargin("paper".into()));
        let err = v
            .place_market(&btc, OrderSide::Buy, d("0.1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::InsufficientMargin(_)));
        assert!(v.place_market(&btc, OrderSide::Buy, d("0.1"), false).await.is_ok());
    }
}
