//! Post-hoc compensation when atomicity fails.
//!
//! Opening path: every leg that filled is flattened by an opposite-side
//! market order sized to the exact filled quantity, reduce-only. Closing
//! path with `CompleteExit`: the legs that failed to close are completed at
//! market instead, since the position is already half-closed and flat is the
//! cheap side to finish on.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{OrderResult, OrderSide};
use crate::venue::{OrderState, VenueClient};

use super::leg::LegPlan;
use super::{CloseRetryPolicy, ExecError, ExecIntent};

/// Outcome of a compensation pass that reached flat.
pub(crate) struct Compensation {
    pub orders: Vec<OrderResult>,
    pub cost_usd: Decimal,
}

/// Flatten every fill the invocation caused.
///
/// Used for failed opens, and for failed closes under `RestoreFlat` (where
/// "flat" means undoing the partial close: the compensator direction is the
/// opposite of the close order either way).
pub(crate) async fn flatten_fills(
    plans: &[LegPlan],
    filled: &[OrderResult],
    failed: &[OrderResult],
    timeout: Duration,
    poll_interval: Duration,
    intent: ExecIntent,
    invocation: Uuid,
) -> Result<Compensation, ExecError> {
    let deadline = Instant::now() + timeout;
    let mut compensators = Vec::new();
    let mut cost = Decimal::ZERO;
    let mut residual: Vec<String> = Vec::new();

    // Reopening a closed leg must not be reduce-only; flattening a fresh
    // fill must be.
    let reduce_only = matches!(intent, ExecIntent::Open);

    for result in filled.iter().chain(failed.iter()) {
        if !result.has_fill() {
            continue;
        }
        let Some(plan) = plan_for(plans, result) else {
            residual.push(format!(
                "{} {} {}: no plan for filled leg",
                result.venue, result.symbol, result.side
            ));
            continue;
        };

        let side = result.side.opposite();
        let quantity = result.filled_quantity;
        info!(%invocation, venue = %result.venue, %side, %quantity,
              "placing rollback compensator");

        match place_and_await(
            &*plan.spec.client,
            plan,
            side,
            quantity,
            reduce_only,
            deadline,
            poll_interval,
        )
        .await
        {
            Ok(comp) => {
                cost += comp.slippage_usd;
                if comp.filled_quantity < quantity - plan.step {
                    residual.push(format!(
                        "{} {}: compensator filled {} of {}",
                        result.venue, result.symbol, comp.filled_quantity, quantity
                    ));
                }
                compensators.push(comp);
            }
            Err(reason) => {
                residual.push(format!("{} {}: {reason}", result.venue, result.symbol));
            }
        }
    }

    if residual.is_empty() {
        Ok(Compensation {
            orders: compensators,
            cost_usd: cost,
        })
    } else {
        Err(ExecError::PartialFillLeftExposed {
            residual: residual.join("; "),
        })
    }
}

/// Close-path completion: market the unclosed remainder of each failed leg.
pub(crate) async fn complete_exit(
    plans: &[LegPlan],
    failed: &[OrderResult],
    timeout: Duration,
    poll_interval: Duration,
    retry: CloseRetryPolicy,
    invocation: Uuid,
) -> Result<Compensation, ExecError> {
    let deadline = Instant::now() + timeout;
    let mut compensators = Vec::new();
    let mut cost = Decimal::ZERO;
    let mut residual: Vec<String> = Vec::new();

    for result in failed {
        let Some(plan) = plan_for(plans, result) else {
            residual.push(format!(
                "{} {} {}: no plan for failed close leg",
                result.venue, result.symbol, result.side
            ));
            continue;
        };
        let remaining = plan.quantity - result.filled_quantity;
        if remaining <= plan.step {
            continue;
        }
        info!(%invocation, venue = %result.venue, side = %result.side, %remaining,
              "completing exit at market");

        let mut attempts = match retry {
            CloseRetryPolicy::Escalate => 1,
            CloseRetryPolicy::RetryOnce => 2,
        };
        let mut done = false;
        while attempts > 0 && !done {
            attempts -= 1;
            match place_and_await(
                &*plan.spec.client,
                plan,
                result.side,
                remaining,
                true,
                deadline,
                poll_interval,
            )
            .await
            {
                Ok(comp) => {
                    cost += comp.slippage_usd;
                    done = comp.filled_quantity >= remaining - plan.step;
                    if !done && attempts == 0 {
                        residual.push(format!(
                            "{} {}: exit completion filled {} of {}",
                            result.venue, result.symbol, comp.filled_quantity, remaining
                        ));
                    }
                    compensators.push(comp);
                }
                Err(reason) => {
                    if attempts == 0 {
                        residual.push(format!("{} {}: {reason}", result.venue, result.symbol));
                    } else {
                        warn!(%invocation, venue = %result.venue, %reason,
                              "exit completion failed; retrying once");
                    }
                }
            }
        }
    }

    if residual.is_empty() {
        Ok(Compensation {
            orders: compensators,
            cost_usd: cost,
        })
    } else {
        Err(ExecError::PartialFillLeftExposed {
            residual: residual.join("; "),
        })
    }
}

fn plan_for<'a>(plans: &'a [LegPlan], result: &OrderResult) -> Option<&'a LegPlan> {
    plans
        .iter()
        .find(|p| p.spec.venue() == &result.venue && p.spec.side == result.side)
}

/// Place one market compensator and poll it to terminal within the shared
/// deadline. Returns the compensator's result or a reason string.
async fn place_and_await(
    client: &dyn VenueClient,
    plan: &LegPlan,
    side: OrderSide,
    quantity: Decimal,
    reduce_only: bool,
    deadline: Instant,
    poll_interval: Duration,
) -> Result<OrderResult, String> {
    // Slippage on a compensator is measured against the book it actually
    // traded into, not the stale pricing mid.
    let ref_mid = match client.fetch_bbo(&plan.spec.symbol).await {
        Ok((bid, ask)) => (bid + ask) / Decimal::TWO,
        Err(_) => plan.ref_mid,
    };

    let order_id = client
        .place_market(&plan.spec.symbol, side, quantity, reduce_only)
        .await
        .map_err(|e| format!("compensator rejected: {e}"))?;

    loop {
        match client.get_order(&order_id).await {
            Ok(snap) if snap.state.is_terminal() => {
                if snap.state != OrderState::Filled && snap.filled_quantity < quantity - plan.step {
                    return Err(format!(
                        "compensator {order_id} terminal {:?} with {} of {} filled",
                        snap.state, snap.filled_quantity, quantity
                    ));
                }
                let slippage = match (snap.avg_fill_price, side) {
                    (Some(avg), OrderSide::Buy) => {
                        ((avg - ref_mid) * snap.filled_quantity).max(Decimal::ZERO)
                    }
                    (Some(avg), OrderSide::Sell) => {
                        ((ref_mid - avg) * snap.filled_quantity).max(Decimal::ZERO)
                    }
                    (None, _) => Decimal::ZERO,
                };
                return Ok(OrderResult {
                    venue: plan.spec.venue().clone(),
                    symbol: plan.spec.symbol.clone(),
                    side,
                    success: true,
                    order_id: Some(order_id),
                    filled_quantity: snap.filled_quantity,
                    avg_fill_price: snap.avg_fill_price,
                    slippage_usd: slippage,
                    mode_used: crate::model::ExecutionMode::MarketOnly,
                    error: None,
                });
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(format!("compensator status poll failed: {e}")),
        }
        if Instant::now() >= deadline {
            return Err(format!("compensator {order_id} did not settle before deadline"));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
