//! Atomic multi-venue order executor.
//!
//! Given N legs (two for a funding-arb pair), either every leg fills the
//! requested size within tolerance, or every fill the invocation caused is
//! flattened by a compensating order before control returns. The per-call
//! flow is an explicit state machine:
//!
//! `PREFLIGHT -> PLACING -> WATCHING -> (SUCCESS | HEDGING | ROLLBACK | FAILED)`
//!
//! Transitions are values, never exceptions; errors escape only for the two
//! hard cases (nothing placed, or rollback could not flatten).

mod leg;
mod preflight;
mod rollback;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::market::{PriceCache, PriceSource};
use crate::model::{AtomicExecutionResult, OrderResult, OrderSpec, Symbol, VenueId};
use crate::venue::{round_to_step, round_to_tick};

pub use leg::LegPlan;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("need at least two legs, got {0}")]
    TooFewLegs(usize),

    #[error("rollback_on_partial=false is unsafe for opening invocations")]
    UnsafeFlag,

    #[error("insufficient liquidity on {venue} {symbol}: wanted ${wanted}, available ${available}")]
    InsufficientLiquidity {
        venue: VenueId,
        symbol: Symbol,
        wanted: Decimal,
        available: Decimal,
    },

    #[error("estimated slippage {est_bps}bps on {venue} {symbol} exceeds limit {max_bps}bps")]
    SlippageTooHigh {
        venue: VenueId,
        symbol: Symbol,
        est_bps: Decimal,
        max_bps: Decimal,
    },

    #[error("no usable quote on {venue} {symbol}: {reason}")]
    QuoteUnavailable {
        venue: VenueId,
        symbol: Symbol,
        reason: String,
    },

    #[error("leg sizing produced zero quantity on {venue} {symbol}")]
    ZeroQuantity { venue: VenueId, symbol: Symbol },

    /// Rollback (or close completion) could not reach a flat state. The
    /// caller must alert and halt new opens; a human has to look.
    #[error("exposure left after failed rollback: {residual}")]
    PartialFillLeftExposed { residual: String },
}

impl ExecError {
    /// Whether the strategy may simply skip and continue.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExecError::PartialFillLeftExposed { .. })
    }
}

// ── Invocation options ──────────────────────────────────────────────

/// What kind of invocation this is; drives the compensation bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecIntent {
    /// Opening a new pair: compensation restores a flat book.
    Open,
    /// Closing an existing pair: compensation follows `ClosePolicy`.
    Close(ClosePolicy),
}

/// What to do when only part of a close fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// Finish the exit: market-complete the legs that did not fill.
    /// The position is already half-closed; going flat is the cheap side.
    CompleteExit,
    /// Undo the partial close by re-opening what was closed.
    RestoreFlat,
}

/// Whether a failed close completion gets one more attempt before the
/// invocation escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseRetryPolicy {
    #[default]
    Escalate,
    RetryOnce,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub rollback_on_partial: bool,
    pub pre_flight: bool,
    pub intent: ExecIntent,
}

impl ExecOptions {
    pub fn open() -> Self {
        ExecOptions {
            rollback_on_partial: true,
            pre_flight: true,
            intent: ExecIntent::Open,
        }
    }

    pub fn close(policy: ClosePolicy) -> Self {
        ExecOptions {
            rollback_on_partial: true,
            pre_flight: true,
            intent: ExecIntent::Close(policy),
        }
    }
}

// ── Configuration & metrics ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Cadence of `get_order` polling while a leg is outstanding.
    pub poll_interval: Duration,
    /// Ladder depth requested during pre-flight.
    pub preflight_depth_levels: usize,
    /// Pre-flight refuses legs whose estimated taker slippage exceeds this.
    pub max_preflight_slippage_bps: Decimal,
    /// Freshness window for the shared price cache.
    pub price_cache_ttl: Duration,
    /// Bound on the whole compensation pass.
    pub rollback_timeout: Duration,
    pub close_retry: CloseRetryPolicy,
    /// Pre-flight runs, nothing is placed.
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            poll_interval: Duration::from_millis(500),
            preflight_depth_levels: 20,
            max_preflight_slippage_bps: Decimal::from(25),
            price_cache_ttl: Duration::from_secs(5),
            rollback_timeout: Duration::from_secs(30),
            close_retry: CloseRetryPolicy::Escalate,
            dry_run: false,
        }
    }
}

/// Lifetime counters, logged at cycle end by the strategy.
#[derive(Debug, Clone, Default)]
pub struct ExecutorMetrics {
    pub invocations: u64,
    pub successes: u64,
    pub clean_rollbacks: u64,
    pub preflight_refusals: u64,
    pub critical_failures: u64,
    pub total_slippage_usd: Decimal,
    pub total_rollback_cost_usd: Decimal,
}

// ── State machine ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Preflight,
    Placing,
    Watching,
    Hedging,
    Rollback,
    Success,
    Failed,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecState::Preflight => "PREFLIGHT",
            ExecState::Placing => "PLACING",
            ExecState::Watching => "WATCHING",
            ExecState::Hedging => "HEDGING",
            ExecState::Rollback => "ROLLBACK",
            ExecState::Success => "SUCCESS",
            ExecState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

// ── Executor ────────────────────────────────────────────────────────

pub struct AtomicExecutor {
    cache: Arc<PriceCache>,
    cfg: ExecutorConfig,
    metrics: Mutex<ExecutorMetrics>,
}

impl AtomicExecutor {
    pub fn new(cache: Arc<PriceCache>, cfg: ExecutorConfig) -> Self {
        AtomicExecutor {
            cache,
            cfg,
            metrics: Mutex::new(ExecutorMetrics::default()),
        }
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics.lock().clone()
    }

    /// Run one atomic invocation over `orders`.
    ///
    /// Returns `Ok` for every outcome that leaves no net new exposure:
    /// full success, nothing filled, or a clean rollback. `Err` means either
    /// nothing was ever placed (pre-flight refusal, recoverable) or residual
    /// exposure remains (critical).
    pub async fn execute_atomically(
        &self,
        orders: Vec<OrderSpec>,
        opts: ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<AtomicExecutionResult, ExecError> {
        if orders.len() < 2 {
            return Err(ExecError::TooFewLegs(orders.len()));
        }
        if opts.intent == ExecIntent::Open && !opts.rollback_on_partial {
            return Err(ExecError::UnsafeFlag);
        }

        self.metrics.lock().invocations += 1;
        let invocation = Uuid::new_v4();
        let started = Instant::now();
        let mut state = ExecState::Preflight;
        debug!(%invocation, legs = orders.len(), intent = ?opts.intent, %state,
               "executor invocation started");

        // ── PREFLIGHT ──
        if opts.pre_flight {
            if let Err(e) = preflight::run(
                &orders,
                self.cfg.preflight_depth_levels,
                self.cfg.max_preflight_slippage_bps,
                &self.cache,
            )
            .await
            {
                self.metrics.lock().preflight_refusals += 1;
                self.transition(invocation, &mut state, ExecState::Failed);
                warn!(%invocation, error = %e, "pre-flight refused; nothing placed");
                return Err(e);
            }
        }

        if self.cfg.dry_run {
            info!(%invocation, "dry run: pre-flight passed, skipping placement");
            return Ok(AtomicExecutionResult {
                success: true,
                all_filled: false,
                filled_orders: Vec::new(),
                failed_orders: Vec::new(),
                rollback_performed: false,
                rollback_cost_usd: Decimal::ZERO,
                total_slippage_usd: Decimal::ZERO,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        // ── PLACING ──
        let plans = self.plan_legs(&orders, opts.intent).await?;
        self.transition(invocation, &mut state, ExecState::Placing);

        let inv_token = cancel.child_token();
        let hedge_enabled =
            opts.rollback_on_partial && matches!(opts.intent, ExecIntent::Open);
        let (fill_tx, fill_rx) = watch::channel::<Option<usize>>(None);

        let mut join_set = tokio::task::JoinSet::new();
        for plan in &plans {
            let ctx = leg::LegContext {
                plan: plan.clone(),
                poll_interval: self.cfg.poll_interval,
                hedge_enabled,
                fill_tx: fill_tx.clone(),
                fill_rx: fill_rx.clone(),
                token: inv_token.clone(),
                invocation,
            };
            join_set.spawn(leg::run_leg(ctx));
        }

        // ── WATCHING ──
        self.transition(invocation, &mut state, ExecState::Watching);
        let max_leg_timeout = plans
            .iter()
            .map(|p| p.spec.timeout)
            .max()
            .unwrap_or(Duration::from_secs(30));
        // Legs bound themselves by their own timeouts; this outer deadline
        // only catches a stuck venue mid-escalation.
        let invocation_deadline = tokio::time::Instant::now() + max_leg_timeout * 2;

        let mut indexed: Vec<(usize, OrderResult)> = Vec::with_capacity(plans.len());
        let mut deadline_armed = true;
        let mut first_fill_rx = fill_rx;
        let mut hedge_watch = hedge_enabled;
        loop {
            let next = tokio::select! {
                next = join_set.join_next() => next,
                _ = tokio::time::sleep_until(invocation_deadline), if deadline_armed => {
                    warn!(%invocation, "invocation deadline hit; cancelling outstanding legs");
                    deadline_armed = false;
                    inv_token.cancel();
                    continue;
                }
                changed = first_fill_rx.changed(), if hedge_watch => {
                    // First terminal fill while siblings are still working:
                    // the legs race to complete the hedge from here.
                    hedge_watch = false;
                    if changed.is_ok()
                        && let Some(leg_index) = *first_fill_rx.borrow_and_update()
                    {
                        self.transition(invocation, &mut state, ExecState::Hedging);
                        debug!(%invocation, leg = leg_index,
                               "first leg filled; siblings escalating");
                    }
                    continue;
                }
                _ = cancel.cancelled(), if !inv_token.is_cancelled() => {
                    // Upstream abort (shutdown, kill switch): equivalent to
                    // entering rollback from wherever the legs are now.
                    warn!(%invocation, "invocation aborted by caller; cancelling legs");
                    inv_token.cancel();
                    continue;
                }
            };
            match next {
                Some(Ok(report)) => indexed.push(report),
                Some(Err(join_err)) => {
                    error!(%invocation, error = %join_err, "leg task panicked");
                }
                None => break,
            }
        }
        drop(first_fill_rx);
        indexed.sort_by_key(|(index, _)| *index);
        let results: Vec<OrderResult> = indexed.into_iter().map(|(_, r)| r).collect();

        let all_filled = results.len() == plans.len()
            && results
                .iter()
                .zip(plans.iter())
                .all(|(r, p)| r.success && r.filled_quantity >= p.quantity - p.step);
        let total_slippage: Decimal = results.iter().map(|r| r.slippage_usd).sum();

        if all_filled {
            self.transition(invocation, &mut state, ExecState::Success);
            let mut metrics = self.metrics.lock();
            metrics.successes += 1;
            metrics.total_slippage_usd += total_slippage;
            drop(metrics);
            for r in &results {
                info!(%invocation, venue = %r.venue, side = %r.side,
                      filled = %r.filled_quantity,
                      avg_price = %r.avg_fill_price.unwrap_or_default(),
                      slippage_usd = %r.slippage_usd, "leg filled");
            }
            return Ok(AtomicExecutionResult {
                success: true,
                all_filled: true,
                filled_orders: results,
                failed_orders: Vec::new(),
                rollback_performed: false,
                rollback_cost_usd: Decimal::ZERO,
                total_slippage_usd: total_slippage,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        // Partition outcomes: a leg with any fill belongs to the filled set
        // for rollback sizing even if it ultimately failed.
        let any_fill = results.iter().any(|r| r.has_fill());
        let (filled, failed): (Vec<OrderResult>, Vec<OrderResult>) =
            results.into_iter().partition(|r| r.has_fill() && r.success);

        if !any_fill || !opts.rollback_on_partial {
            // Nothing to unwind (or the caller opted out on a close).
            self.transition(invocation, &mut state, ExecState::Failed);
            warn!(%invocation, failed = failed.len(),
                  "invocation did not fill; no exposure to unwind");
            return Ok(AtomicExecutionResult {
                success: true,
                all_filled: false,
                filled_orders: filled,
                failed_orders: failed,
                rollback_performed: false,
                rollback_cost_usd: Decimal::ZERO,
                total_slippage_usd: total_slippage,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        // ── ROLLBACK ──
        self.transition(invocation, &mut state, ExecState::Rollback);
        let outcome = match opts.intent {
            ExecIntent::Open | ExecIntent::Close(ClosePolicy::RestoreFlat) => {
                rollback::flatten_fills(
                    &plans,
                    &filled,
                    &failed,
                    self.cfg.rollback_timeout,
                    self.cfg.poll_interval,
                    opts.intent,
                    invocation,
                )
                .await
            }
            ExecIntent::Close(ClosePolicy::CompleteExit) => {
                rollback::complete_exit(
                    &plans,
                    &failed,
                    self.cfg.rollback_timeout,
                    self.cfg.poll_interval,
                    self.cfg.close_retry,
                    invocation,
                )
                .await
            }
        };

        match outcome {
            Ok(compensation) => {
                let mut metrics = self.metrics.lock();
                metrics.clean_rollbacks += 1;
                metrics.total_rollback_cost_usd += compensation.cost_usd;
                metrics.total_slippage_usd += total_slippage;
                drop(metrics);
                info!(%invocation, cost_usd = %compensation.cost_usd,
                      compensators = compensation.orders.len(),
                      "rollback complete; no net exposure remains");

                // Under complete-exit the compensators finished the very
                // legs that failed, so their fills belong to the close
                // record, not to a separate rollback bucket.
                let (mut filled, mut failed) = (filled, failed);
                if matches!(opts.intent, ExecIntent::Close(ClosePolicy::CompleteExit)) {
                    for mut leg in std::mem::take(&mut failed) {
                        for comp in compensation
                            .orders
                            .iter()
                            .filter(|c| c.venue == leg.venue && c.side == leg.side)
                        {
                            let total = leg.filled_quantity + comp.filled_quantity;
                            if total > Decimal::ZERO {
                                let notional =
                                    leg.filled_notional() + comp.filled_notional();
                                leg.avg_fill_price = Some(notional / total);
                                leg.filled_quantity = total;
                            }
                            leg.slippage_usd += comp.slippage_usd;
                        }
                        leg.success = leg.has_fill();
                        leg.error = None;
                        if leg.success {
                            filled.push(leg);
                        } else {
                            failed.push(leg);
                        }
                    }
                }

                Ok(AtomicExecutionResult {
                    success: true,
                    all_filled: false,
                    filled_orders: filled,
                    failed_orders: failed,
                    rollback_performed: true,
                    rollback_cost_usd: compensation.cost_usd,
                    total_slippage_usd: total_slippage + compensation.cost_usd,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.transition(invocation, &mut state, ExecState::Failed);
                self.metrics.lock().critical_failures += 1;
                error!(%invocation, error = %e,
                       "rollback failed; residual exposure requires operator action");
                Err(e)
            }
        }
    }

    fn transition(&self, invocation: Uuid, state: &mut ExecState, next: ExecState) {
        debug!(%invocation, from = %state, to = %next, "executor state transition");
        *state = next;
    }

    /// Price and size every leg from the warmed cache.
    ///
    /// For a two-legged opening pair on one symbol, both legs are sized to a
    /// common base quantity before per-venue step rounding, so the fills can
    /// only diverge by the coarser venue's step.
    async fn plan_legs(
        &self,
        orders: &[OrderSpec],
        intent: ExecIntent,
    ) -> Result<Vec<LegPlan>, ExecError> {
        let mut plans = Vec::with_capacity(orders.len());
        for (index, spec) in orders.iter().enumerate() {
            let venue = spec.venue().clone();
            let (bid, ask) = match self.cache.get_bbo(
                &venue,
                &spec.symbol,
                self.cfg.price_cache_ttl,
            ) {
                Some(bbo) => bbo,
                None => {
                    // Cache miss: fetch fresh depth and warm it on the way.
                    let snap = spec
                        .client
                        .fetch_depth(&spec.symbol, self.cfg.preflight_depth_levels)
                        .await
                        .map_err(|e| ExecError::QuoteUnavailable {
                            venue: venue.clone(),
                            symbol: spec.symbol.clone(),
                            reason: e.to_string(),
                        })?;
                    self.cache.cache_depth(&snap, PriceSource::Direct);
                    match (snap.best_bid(), snap.best_ask()) {
                        (Some(b), Some(a)) => (b, a),
                        _ => {
                            return Err(ExecError::QuoteUnavailable {
                                venue,
                                symbol: spec.symbol.clone(),
                                reason: "one-sided book".into(),
                            });
                        }
                    }
                }
            };

            let tick = spec.client.tick_size(&spec.symbol).map_err(|e| {
                ExecError::QuoteUnavailable {
                    venue: venue.clone(),
                    symbol: spec.symbol.clone(),
                    reason: e.to_string(),
                }
            })?;
            let step = spec.client.size_step(&spec.symbol).map_err(|e| {
                ExecError::QuoteUnavailable {
                    venue: venue.clone(),
                    symbol: spec.symbol.clone(),
                    reason: e.to_string(),
                }
            })?;

            let mid = (bid + ask) / Decimal::TWO;
            let offset = spec.limit_offset_bps / Decimal::from(10_000);
            // Positive offset rests inside the spread; negative crosses it.
            let raw_price = match spec.side {
                crate::model::OrderSide::Buy => ask * (Decimal::ONE - offset),
                crate::model::OrderSide::Sell => bid * (Decimal::ONE + offset),
            };
            let limit_price = round_to_tick(raw_price, tick, spec.side);
            // A rounded price collapsing onto (or through) the far touch on a
            // one-tick spread is fine; zero or negative is not.
            if limit_price <= Decimal::ZERO {
                return Err(ExecError::QuoteUnavailable {
                    venue,
                    symbol: spec.symbol.clone(),
                    reason: format!("degenerate limit price {limit_price}"),
                });
            }

            let quantity = match spec.quantity {
                Some(q) => q,
                None => {
                    if mid <= Decimal::ZERO {
                        return Err(ExecError::QuoteUnavailable {
                            venue,
                            symbol: spec.symbol.clone(),
                            reason: "non-positive mid".into(),
                        });
                    }
                    spec.size_usd / mid
                }
            };

            plans.push(LegPlan {
                index,
                spec: spec.clone(),
                quantity,
                limit_price,
                ref_mid: mid,
                tick,
                step,
            });
        }

        // Delta-neutral sizing for an opening pair on one symbol.
        if intent == ExecIntent::Open
            && plans.len() == 2
            && plans[0].spec.symbol == plans[1].spec.symbol
            && plans[0].spec.side != plans[1].spec.side
        {
            let common = plans[0].quantity.min(plans[1].quantity);
            for plan in &mut plans {
                plan.quantity = common;
            }
        }

        for plan in &mut plans {
            plan.quantity = round_to_step(plan.quantity, plan.step);
            if plan.quantity <= Decimal::ZERO {
                return Err(ExecError::ZeroQuantity {
                    venue: plan.spec.venue().clone(),
                    symbol: plan.spec.symbol.clone(),
                });
            }
        }

        Ok(plans)
    }
}
