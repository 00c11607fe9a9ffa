//! One outgoing order, worked to a terminal state on its own task.
//!
//! A leg never returns an error: every failure mode is folded into the
//! `OrderResult` it reports, so the invocation can reason about fills and
//! compensation uniformly.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{ExecutionMode, OrderResult, OrderSpec};
use crate::venue::{OrderSnapshot, OrderState, VenueClient};

/// Priced and sized leg, ready to submit.
#[derive(Debug, Clone)]
pub struct LegPlan {
    pub index: usize,
    pub spec: OrderSpec,
    /// Base quantity to work, already step-rounded.
    pub quantity: Decimal,
    /// Tick-rounded limit price (unused for market-only legs).
    pub limit_price: Decimal,
    /// Mid at pricing time; slippage is measured against this.
    pub ref_mid: Decimal,
    pub tick: Decimal,
    pub step: Decimal,
}

impl LegPlan {
    pub fn filled_within_tolerance(&self, filled: Decimal) -> bool {
        filled >= self.quantity - self.step
    }
}

pub(crate) struct LegContext {
    pub plan: LegPlan,
    pub poll_interval: Duration,
    /// Escalate a resting limit to market as soon as a sibling fills.
    pub hedge_enabled: bool,
    pub fill_tx: watch::Sender<Option<usize>>,
    pub fill_rx: watch::Receiver<Option<usize>>,
    pub token: CancellationToken,
    pub invocation: Uuid,
}

enum WaitOutcome {
    Terminal(OrderSnapshot),
    Deadline,
    SiblingFilled,
    Cancelled,
}

pub(crate) async fn run_leg(mut ctx: LegContext) -> (usize, OrderResult) {
    let index = ctx.plan.index;
    let result = match ctx.plan.spec.mode {
        ExecutionMode::MarketOnly => market_leg(&ctx).await,
        ExecutionMode::LimitOnly | ExecutionMode::LimitWithFallback => limit_leg(&mut ctx).await,
    };
    if result.success {
        // First terminal fill wins; later fills leave the signal untouched.
        ctx.fill_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(index);
                true
            } else {
                false
            }
        });
    }
    (index, result)
}

async fn market_leg(ctx: &LegContext) -> OrderResult {
    let plan = &ctx.plan;
    let spec = &plan.spec;
    let order_id = match spec
        .client
        .place_market(&spec.symbol, spec.side, plan.quantity, spec.reduce_only)
        .await
    {
        Ok(id) => id,
        Err(e) => return failure(plan, ExecutionMode::MarketOnly, None, no_fill(), e.to_string()),
    };

    let deadline = Instant::now() + spec.timeout;
    match wait_for_order(ctx, &order_id, deadline).await {
        WaitOutcome::Terminal(snap) => settle(plan, ExecutionMode::MarketOnly, order_id, snap),
        WaitOutcome::Deadline | WaitOutcome::Cancelled | WaitOutcome::SiblingFilled => {
            reconcile_after_cancel(ctx, ExecutionMode::MarketOnly, &order_id).await
        }
    }
}

async fn limit_leg(ctx: &mut LegContext) -> OrderResult {
    let plan = ctx.plan.clone();
    let spec = &plan.spec;
    let mode = spec.mode;

    let order_id = match spec
        .client
        .place_limit(
            &spec.symbol,
            spec.side,
            plan.quantity,
            plan.limit_price,
            spec.reduce_only,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return failure(&plan, mode, None, no_fill(), e.to_string()),
    };
    debug!(invocation = %ctx.invocation, leg = plan.index, venue = %spec.venue(),
           order_id, price = %plan.limit_price, quantity = %plan.quantity,
           "limit order resting");

    let watch_siblings = ctx.hedge_enabled && mode == ExecutionMode::LimitWithFallback;
    let deadline = Instant::now() + spec.timeout;

    match wait_for_order_mut(ctx, &order_id, deadline, watch_siblings).await {
        WaitOutcome::Terminal(snap) => settle(&plan, mode, order_id, snap),
        WaitOutcome::Cancelled => reconcile_after_cancel(ctx, mode, &order_id).await,
        WaitOutcome::Deadline | WaitOutcome::SiblingFilled => {
            if mode == ExecutionMode::LimitWithFallback {
                escalate_to_market(ctx, &order_id).await
            } else {
                // limit_only: abandon the remainder at timeout.
                reconcile_after_cancel(ctx, mode, &order_id).await
            }
        }
    }
}

/// Cancel the resting limit, reconcile any quantity that filled in flight,
/// then market the remainder. The cancel's returned snapshot is the source
/// of truth for the filled quantity; a fill racing the cancel is folded in
/// here rather than lost.
async fn escalate_to_market(ctx: &LegContext, order_id: &str) -> OrderResult {
    let plan = &ctx.plan;
    let spec = &plan.spec;

    let limit_snap = match spec.client.cancel(order_id).await {
        Ok(snap) => snap,
        Err(e) => {
            return failure(
                plan,
                ExecutionMode::LimitWithFallback,
                Some(order_id.to_string()),
                no_fill(),
                format!("cancel before fallback failed: {e}"),
            );
        }
    };

    let already = limit_snap.filled_quantity;
    if plan.filled_within_tolerance(already) {
        return settle(plan, ExecutionMode::LimitWithFallback, order_id.to_string(), limit_snap);
    }

    let remaining = plan.quantity - already;
    debug!(invocation = %ctx.invocation, leg = plan.index, venue = %spec.venue(),
           already_filled = %already, %remaining, "escalating resting limit to market");

    let market_id = match spec
        .client
        .place_market(&spec.symbol, spec.side, remaining, spec.reduce_only)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            return partial(
                plan,
                ExecutionMode::LimitWithFallback,
                Some(order_id.to_string()),
                &limit_snap,
                format!("market fallback rejected: {e}"),
            );
        }
    };

    let deadline = Instant::now() + spec.timeout;
    match wait_for_order(ctx, &market_id, deadline).await {
        WaitOutcome::Terminal(market_snap) => {
            let combined = combine(&limit_snap, &market_snap);
            if plan.filled_within_tolerance(combined.filled_quantity) {
                settle(plan, ExecutionMode::LimitWithFallback, market_id, combined)
            } else {
                partial(
                    plan,
                    ExecutionMode::LimitWithFallback,
                    Some(market_id),
                    &combined,
                    "market fallback under-filled".to_string(),
                )
            }
        }
        _ => {
            let final_snap = match spec.client.cancel(&market_id).await {
                Ok(snap) => combine(&limit_snap, &snap),
                Err(_) => limit_snap.clone(),
            };
            partial(
                plan,
                ExecutionMode::LimitWithFallback,
                Some(market_id),
                &final_snap,
                "market fallback did not reach terminal state".to_string(),
            )
        }
    }
}

/// Cancel and fold in whatever filled before the cancel landed.
async fn reconcile_after_cancel(ctx: &LegContext, mode: ExecutionMode, order_id: &str) -> OrderResult {
    let plan = &ctx.plan;
    match plan.spec.client.cancel(order_id).await {
        Ok(snap) => {
            if plan.filled_within_tolerance(snap.filled_quantity) {
                // The fill won the race against the cancel.
                settle(plan, mode, order_id.to_string(), snap)
            } else {
                partial(
                    plan,
                    mode,
                    Some(order_id.to_string()),
                    &snap,
                    "cancelled before fill".to_string(),
                )
            }
        }
        Err(e) => {
            warn!(invocation = %ctx.invocation, leg = plan.index, order_id, error = %e,
                  "cancel failed; reporting leg as failed with unknown fills");
            failure(
                plan,
                mode,
                Some(order_id.to_string()),
                no_fill(),
                format!("cancel failed: {e}"),
            )
        }
    }
}

// ── Waiting ─────────────────────────────────────────────────────────

async fn wait_for_order(ctx: &LegContext, order_id: &str, deadline: Instant) -> WaitOutcome {
    let client = ctx.plan.spec.client.clone();
    loop {
        tokio::select! {
            _ = ctx.token.cancelled() => return WaitOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return WaitOutcome::Deadline,
            _ = tokio::time::sleep(ctx.poll_interval) => {
                if let Some(outcome) = poll_once(&*client, order_id).await {
                    return outcome;
                }
            }
        }
    }
}

/// Like `wait_for_order`, but also wakes on the sibling-fill broadcast.
async fn wait_for_order_mut(
    ctx: &mut LegContext,
    order_id: &str,
    deadline: Instant,
    watch_siblings: bool,
) -> WaitOutcome {
    let my_index = ctx.plan.index;
    // A sibling may have filled before this leg started waiting.
    if watch_siblings
        && ctx
            .fill_rx
            .borrow_and_update()
            .is_some_and(|i| i != my_index)
    {
        return WaitOutcome::SiblingFilled;
    }
    let client = ctx.plan.spec.client.clone();
    let token = ctx.token.clone();
    let poll_interval = ctx.poll_interval;
    let fill_rx = &mut ctx.fill_rx;
    loop {
        tokio::select! {
            _ = token.cancelled() => return WaitOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return WaitOutcome::Deadline,
            changed = fill_rx.changed(), if watch_siblings => {
                if changed.is_ok()
                    && fill_rx.borrow_and_update().is_some_and(|i| i != my_index)
                {
                    return WaitOutcome::SiblingFilled;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {
                if let Some(outcome) = poll_once(&*client, order_id).await {
                    return outcome;
                }
            }
        }
    }
}

async fn poll_once(client: &dyn VenueClient, order_id: &str) -> Option<WaitOutcome> {
    match client.get_order(order_id).await {
        Ok(snap) if snap.state.is_terminal() => Some(WaitOutcome::Terminal(snap)),
        Ok(_) => None,
        Err(e) if e.is_transient() => {
            // Keep polling; the deadline bounds us.
            None
        }
        Err(e) => {
            warn!(order_id, error = %e, "order status poll failed terminally");
            Some(WaitOutcome::Terminal(OrderSnapshot {
                order_id: order_id.to_string(),
                state: OrderState::Rejected,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
            }))
        }
    }
}

// ── Result shaping ──────────────────────────────────────────────────

fn no_fill() -> OrderSnapshot {
    OrderSnapshot {
        order_id: String::new(),
        state: OrderState::Rejected,
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
    }
}

fn slippage_usd(plan: &LegPlan, snap: &OrderSnapshot) -> Decimal {
    let Some(avg) = snap.avg_fill_price else {
        return Decimal::ZERO;
    };
    let signed = match plan.spec.side {
        crate::model::OrderSide::Buy => (avg - plan.ref_mid) * snap.filled_quantity,
        crate::model::OrderSide::Sell => (plan.ref_mid - avg) * snap.filled_quantity,
    };
    signed.max(Decimal::ZERO)
}

fn settle(plan: &LegPlan, mode: ExecutionMode, order_id: String, snap: OrderSnapshot) -> OrderResult {
    let success = snap.state == OrderState::Filled
        || plan.filled_within_tolerance(snap.filled_quantity);
    OrderResult {
        venue: plan.spec.venue().clone(),
        symbol: plan.spec.symbol.clone(),
        side: plan.spec.side,
        success,
        order_id: Some(order_id),
        filled_quantity: snap.filled_quantity,
        avg_fill_price: snap.avg_fill_price,
        slippage_usd: slippage_usd(plan, &snap),
        mode_used: mode,
        error: None,
    }
}

fn partial(
    plan: &LegPlan,
    mode: ExecutionMode,
    order_id: Option<String>,
    snap: &OrderSnapshot,
    error: String,
) -> OrderResult {
    OrderResult {
        venue: plan.spec.venue().clone(),
        symbol: plan.spec.symbol.clone(),
        side: plan.spec.side,
        success: false,
        order_id,
        filled_quantity: snap.filled_quantity,
        avg_fill_price: snap.avg_fill_price,
        slippage_usd: slippage_usd(plan, snap),
        mode_used: mode,
        error: Some(error),
    }
}

fn failure(
    plan: &LegPlan,
    mode: ExecutionMode,
    order_id: Option<String>,
    snap: OrderSnapshot,
    error: String,
) -> OrderResult {
    partial(plan, mode, order_id, &snap, error)
}

/// Merge the fills of a cancelled limit and its market fallback into one
/// volume-weighted snapshot.
fn combine(limit: &OrderSnapshot, market: &OrderSnapshot) -> OrderSnapshot {
    let total = limit.filled_quantity + market.filled_quantity;
    let avg = if total > Decimal::ZERO {
        let limit_notional = limit
            .avg_fill_price
            .map(|p| p * limit.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        let market_notional = market
            .avg_fill_price
            .map(|p| p * market.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        Some((limit_notional + market_notional) / total)
    } else {
        None
    };
    OrderSnapshot {
        order_id: market.order_id.clone(),
        state: market.state,
        filled_quantity: total,
        avg_fill_price: avg,
    }
}
