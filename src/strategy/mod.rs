//! Funding-arbitrage strategy: one long-running loop, three phases per tick.
//!
//! Phase 1 (monitor) refreshes divergence and ingests funding payments for
//! every open position. Phase 2 (exit) evaluates the configured rebalance
//! rule and closes what it triggers. Phase 3 (scan) ranks fresh
//! opportunities and opens new pairs up to the configured caps.

pub mod fees;
pub mod finder;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ArbConfig;
use crate::exec::{AtomicExecutor, ClosePolicy, ExecOptions};
use crate::model::position::STRATEGY_FUNDING_ARB;
use crate::model::{
    ArbitrageOpportunity, AtomicExecutionResult, ExecutionMode, ExitReason, FundingPayment,
    OrderResult, OrderSide, OrderSpec, Position, PositionLeg, PositionSide, PositionStatus,
    VenueId,
};
use crate::position::PositionManager;
use crate::store::FundingRateStore;
use crate::venue::{OrderState, VenueClient, VenueError};

use fees::FeeCalculator;
use finder::{LeverageBook, find_opportunities};
use rules::{RebalanceRule, Urgency, build_rule};

/// Per-process counters, logged at every cycle end.
#[derive(Debug, Clone, Default)]
pub struct StrategyMetrics {
    pub cycles: u64,
    pub opportunities_scanned: u64,
    pub opportunities_rejected: u64,
    pub positions_opened: u64,
    pub positions_closed: u64,
    pub exit_triggers: u64,
    pub critical_alerts: u64,
}

pub struct FundingArbStrategy {
    config: ArbConfig,
    clients: HashMap<VenueId, Arc<dyn VenueClient>>,
    executor: Arc<AtomicExecutor>,
    positions: Arc<PositionManager>,
    rates: FundingRateStore,
    fees: FeeCalculator,
    rule: Box<dyn RebalanceRule>,
    /// Kill switch: set on any critical failure; scan skips while set.
    halt_opens: AtomicBool,
    metrics: parking_lot::Mutex<StrategyMetrics>,
}

impl FundingArbStrategy {
    pub fn new(
        config: ArbConfig,
        clients: HashMap<VenueId, Arc<dyn VenueClient>>,
        executor: Arc<AtomicExecutor>,
        positions: Arc<PositionManager>,
        rates: FundingRateStore,
    ) -> Self {
        let fees = config.fee_calculator();
        let rule = build_rule(
            config.rebalance_rule,
            config.erosion_threshold,
            config.max_age(),
        );
        FundingArbStrategy {
            config,
            clients,
            executor,
            positions,
            rates,
            fees,
            rule,
            halt_opens: AtomicBool::new(false),
            metrics: parking_lot::Mutex::new(StrategyMetrics::default()),
        }
    }

    pub fn metrics(&self) -> StrategyMetrics {
        self.metrics.lock().clone()
    }

    pub fn opens_halted(&self) -> bool {
        self.halt_opens.load(Ordering::SeqCst)
    }

    /// Run until `shutdown` fires (or one tick when `once` is set).
    ///
    /// Shutdown is cooperative: the token is threaded into every executor
    /// invocation, so an in-flight open rolls back rather than being
    /// abandoned, and the loop exits after the current tick.
    pub async fn run(&self, shutdown: CancellationToken, once: bool) -> anyhow::Result<()> {
        self.startup(&shutdown).await?;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            // Generous bound: the executor limits itself per invocation, so
            // this only catches a wedged venue call in the monitor phase.
            let tick_budget = self.config.cycle_interval() * 2 + self.config.order_timeout() * 4;
            match tokio::time::timeout(tick_budget, self.tick(&shutdown)).await {
                Ok(()) => {}
                Err(_) => {
                    warn!(budget_secs = tick_budget.as_secs(), "cycle exceeded its budget");
                }
            }

            if once {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.cycle_interval()) => {}
            }
        }

        info!("strategy loop stopped");
        Ok(())
    }

    /// Rebuild state from the database, reconcile against the venues, and
    /// resume any close that was in flight when the process died.
    async fn startup(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let loaded = self.positions.load().await?;
        info!(loaded, "restored non-closed positions from database");

        let flagged = self.positions.reconcile(&self.clients).await?;
        if !flagged.is_empty() {
            self.raise_alert(&format!(
                "{} position(s) disagree with venue state; halting new opens",
                flagged.len()
            ));
        }

        for position in self.positions.list_pending_close().await {
            if position.needs_reconciliation {
                continue;
            }
            let reason = position.exit_reason.unwrap_or(ExitReason::Manual);
            warn!(position = %position.id, reason = %reason,
                  "found close pending at startup; resuming");
            self.close_position(&position, reason, Urgency::Normal, shutdown)
                .await;
        }
        Ok(())
    }

    async fn tick(&self, shutdown: &CancellationToken) {
        let cycle = {
            let mut metrics = self.metrics.lock();
            metrics.cycles += 1;
            metrics.cycles
        };
        let open = self.positions.list_open().await;
        info!(cycle, open_positions = open.len(), "cycle start");

        self.monitor_phase(&open).await;
        self.exit_phase(shutdown).await;
        self.scan_phase(shutdown).await;

        let metrics = self.metrics();
        let exec = self.executor.metrics();
        info!(
            cycle,
            opened = metrics.positions_opened,
            closed = metrics.positions_closed,
            rollbacks = exec.clean_rollbacks,
            rollback_cost_usd = %exec.total_rollback_cost_usd,
            slippage_usd = %exec.total_slippage_usd,
            halted = self.opens_halted(),
            "cycle end"
        );
    }

    // ── Phase 1: monitor ────────────────────────────────────────────

    async fn monitor_phase(&self, open: &[Position]) {
        for position in open {
            self.ingest_funding(position).await;
            self.refresh_divergence(position).await;
        }
    }

    async fn ingest_funding(&self, position: &Position) {
        for leg in [&position.long_leg, &position.short_leg] {
            let Some(client) = self.clients.get(&leg.venue) else {
                continue;
            };
            let events = match client
                .funding_events_since(&position.symbol, position.last_check_at)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(position = %position.id, venue = %leg.venue, error = %e,
                          "could not fetch funding events");
                    continue;
                }
            };
            for event in events {
                let payment = FundingPayment {
                    id: 0,
                    position_id: position.id,
                    venue: leg.venue.clone(),
                    symbol: position.symbol.clone(),
                    funding_rate: event.funding_rate,
                    payment_amount_usd: event.amount_usd,
                    payment_time: event.applied_at,
                };
                if let Err(e) = self.positions.record_funding_payment(payment).await {
                    error!(position = %position.id, venue = %leg.venue, error = %e,
                           "failed to persist funding payment");
                } else {
                    debug!(position = %position.id, venue = %leg.venue,
                           amount_usd = %event.amount_usd, "funding payment recorded");
                }
            }
        }
    }

    async fn refresh_divergence(&self, position: &Position) {
        let long = self
            .rates
            .latest_for(&position.long_leg.venue, &position.symbol)
            .await;
        let short = self
            .rates
            .latest_for(&position.short_leg.venue, &position.symbol)
            .await;
        match (long, short) {
            (Ok(Some(long)), Ok(Some(short))) => {
                let divergence = short.sample.normalized_rate - long.sample.normalized_rate;
                if let Err(e) = self
                    .positions
                    .update_position_state(position.id, divergence, Utc::now())
                    .await
                {
                    error!(position = %position.id, error = %e,
                           "failed to persist divergence update");
                }
            }
            _ => {
                warn!(position = %position.id, symbol = %position.symbol,
                      "missing funding samples; divergence not refreshed");
            }
        }
    }

    // ── Phase 2: exit ───────────────────────────────────────────────

    async fn exit_phase(&self, shutdown: &CancellationToken) {
        let now = Utc::now();
        for position in self.positions.list_open().await {
            if shutdown.is_cancelled() {
                return;
            }
            if position.needs_reconciliation {
                continue;
            }
            let Some(trigger) = self.rule.evaluate(&position, now) else {
                continue;
            };
            self.metrics.lock().exit_triggers += 1;
            info!(position = %position.id, symbol = %position.symbol,
                  rule = self.rule.name(), reason = %trigger.reason,
                  urgency = ?trigger.urgency,
                  entry_divergence = %position.entry_divergence,
                  current_divergence = %position.current_divergence,
                  "exit triggered");
            self.close_position(&position, trigger.reason, trigger.urgency, shutdown)
                .await;
        }
    }

    /// Drive one position through pending_close to closed.
    ///
    /// The durable transition lands first, then the executor is invoked with
    /// reduce-only legs sized to the live venue quantities. Complete-exit
    /// compensation means a partial close is finished at market rather than
    /// reopened.
    async fn close_position(
        &self,
        position: &Position,
        reason: ExitReason,
        urgency: Urgency,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self.positions.mark_pending_close(position.id, reason).await {
            error!(position = %position.id, error = %e, "could not mark pending_close");
            return;
        }

        let mode = match urgency {
            Urgency::Urgent => ExecutionMode::MarketOnly,
            Urgency::Normal => ExecutionMode::LimitWithFallback,
        };

        let mut specs = Vec::new();
        for leg in [&position.long_leg, &position.short_leg] {
            let Some(client) = self.clients.get(&leg.venue) else {
                self.raise_alert(&format!(
                    "no venue client for {} while closing {}",
                    leg.venue, position.id
                ));
                return;
            };
            let live = match client.get_position(&position.symbol).await {
                Ok(live) => live,
                Err(e) => {
                    error!(position = %position.id, venue = %leg.venue, error = %e,
                           "cannot read live position; close deferred");
                    return;
                }
            };
            if live.quantity.is_zero() {
                warn!(position = %position.id, venue = %leg.venue,
                      "leg already flat on venue");
                continue;
            }
            let side = if live.quantity > Decimal::ZERO {
                OrderSide::Sell
            } else {
                OrderSide::Buy
            };
            specs.push(OrderSpec {
                client: client.clone(),
                symbol: position.symbol.clone(),
                side,
                size_usd: live.quantity.abs() * live.mark_price,
                quantity: Some(live.quantity.abs()),
                mode,
                limit_offset_bps: self.config.limit_offset_bps(&leg.venue),
                reduce_only: true,
                timeout: self.config.order_timeout(),
            });
        }

        let result = match specs.len() {
            0 => {
                // Both legs already flat: nothing to trade, settle the books.
                let pnl = position.cumulative_funding_usd - position.total_fees_paid_usd;
                if let Err(e) = self.positions.mark_closed(position.id, pnl, reason).await {
                    error!(position = %position.id, error = %e, "could not mark closed");
                } else {
                    self.metrics.lock().positions_closed += 1;
                }
                return;
            }
            1 => self.close_single_leg(specs.remove(0)).await,
            _ => {
                self.executor
                    .execute_atomically(
                        specs,
                        ExecOptions::close(ClosePolicy::CompleteExit),
                        cancel,
                    )
                    .await
            }
        };

        match result {
            Ok(result) if result.all_filled || result.rollback_performed => {
                let pnl = self.close_pnl(position, &result);
                if let Err(e) = self.positions.mark_closed(position.id, pnl, reason).await {
                    error!(position = %position.id, error = %e, "close filled but not persisted");
                    return;
                }
                self.metrics.lock().positions_closed += 1;
            }
            Ok(_) => {
                // Nothing closed; the pair is still intact. Retry next cycle.
                warn!(position = %position.id,
                      "close attempt did not fill; position stays pending_close");
            }
            Err(e) => {
                self.metrics.lock().critical_alerts += 1;
                if e.is_recoverable() {
                    warn!(position = %position.id, error = %e,
                          "close refused; will retry next cycle");
                } else {
                    self.raise_alert(&format!(
                        "close of {} left residual exposure: {e}",
                        position.id
                    ));
                    let _ = self
                        .positions
                        .set_needs_reconciliation(position.id, true)
                        .await;
                }
            }
        }
    }

    /// Close the one remaining leg of a half-flat pair directly against the
    /// venue; the executor's pair contract does not apply.
    async fn close_single_leg(
        &self,
        spec: OrderSpec,
    ) -> Result<AtomicExecutionResult, crate::exec::ExecError> {
        let client = spec.client.clone();
        let quantity = spec.quantity.unwrap_or(Decimal::ZERO);
        let order_id = client
            .place_market(&spec.symbol, spec.side, quantity, true)
            .await
            .map_err(|e| crate::exec::ExecError::PartialFillLeftExposed {
                residual: format!("{} {}: single-leg close rejected: {e}", spec.venue(), spec.symbol),
            })?;

        let deadline = tokio::time::Instant::now() + spec.timeout;
        loop {
            match client.get_order(&order_id).await {
                Ok(snap) if snap.state.is_terminal() => {
                    let success = snap.state == OrderState::Filled;
                    let result = OrderResult {
                        venue: spec.venue().clone(),
                        symbol: spec.symbol.clone(),
                        side: spec.side,
                        success,
                        order_id: Some(order_id.clone()),
                        filled_quantity: snap.filled_quantity,
                        avg_fill_price: snap.avg_fill_price,
                        slippage_usd: Decimal::ZERO,
                        mode_used: ExecutionMode::MarketOnly,
                        error: None,
                    };
                    if !success {
                        return Err(crate::exec::ExecError::PartialFillLeftExposed {
                            residual: format!(
                                "{} {}: single-leg close ended {:?}",
                                spec.venue(),
                                spec.symbol,
                                snap.state
                            ),
                        });
                    }
                    return Ok(AtomicExecutionResult {
                        success: true,
                        all_filled: true,
                        filled_orders: vec![result],
                        failed_orders: Vec::new(),
                        rollback_performed: false,
                        rollback_cost_usd: Decimal::ZERO,
                        total_slippage_usd: Decimal::ZERO,
                        elapsed_ms: 0,
                    });
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    return Err(crate::exec::ExecError::PartialFillLeftExposed {
                        residual: format!("single-leg close poll failed: {e}"),
                    });
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(crate::exec::ExecError::PartialFillLeftExposed {
                    residual: format!("single-leg close {order_id} did not settle"),
                });
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Realized PnL at close: funding collected, plus price PnL of the close
    /// fills, minus all fees and the close-side slippage.
    fn close_pnl(&self, position: &Position, result: &AtomicExecutionResult) -> Decimal {
        let mut price_pnl = Decimal::ZERO;
        let mut close_fees = Decimal::ZERO;
        for leg in [&position.long_leg, &position.short_leg] {
            let Some(fill) = result.fill_for(&leg.venue) else {
                continue;
            };
            let Some(avg) = fill.avg_fill_price else {
                continue;
            };
            let pnl = match leg.side {
                PositionSide::Long => (avg - leg.entry_price) * fill.filled_quantity,
                PositionSide::Short => (leg.entry_price - avg) * fill.filled_quantity,
            };
            price_pnl += pnl;
            close_fees += self.fees.taker_fee_usd(&leg.venue, avg * fill.filled_quantity);
        }
        position.cumulative_funding_usd + price_pnl
            - (position.total_fees_paid_usd + close_fees)
            - result.total_slippage_usd
    }

    // ── Phase 3: scan ───────────────────────────────────────────────

    async fn scan_phase(&self, cancel: &CancellationToken) {
        if self.opens_halted() {
            warn!("new opens are halted; skipping scan");
            return;
        }

        let snapshots = match self.rates.latest_snapshots(&self.config.whitelisted_venues).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "funding-rate query failed; skipping scan");
                return;
            }
        };

        let leverage = self.collect_leverage(&snapshots).await;
        let filter = self.config.opportunity_filter();
        let opportunities = find_opportunities(
            &snapshots,
            &leverage,
            &self.fees,
            self.config.target_exposure_per_side_usd,
            &filter,
            Utc::now(),
        );
        self.metrics.lock().opportunities_scanned += opportunities.len() as u64;
        info!(candidates = opportunities.len(), "scan complete");

        let mut opened = 0usize;
        for opportunity in opportunities {
            if cancel.is_cancelled() || opened >= self.config.max_new_positions_per_cycle {
                break;
            }
            if self.positions.list_live().await.len() >= self.config.max_positions {
                info!("max_positions reached; not opening more");
                break;
            }
            if self
                .positions
                .has_live_pair(
                    &opportunity.symbol,
                    &opportunity.long_venue,
                    &opportunity.short_venue,
                )
                .await
            {
                debug!(symbol = %opportunity.symbol, long = %opportunity.long_venue,
                       short = %opportunity.short_venue, "pair already held; skipping");
                continue;
            }
            let live_notional = self.positions.total_live_notional().await;
            if live_notional + self.config.target_exposure_per_side_usd
                > self.config.max_total_exposure_usd
            {
                info!(%live_notional, "exposure cap reached; not opening more");
                break;
            }

            if self.open_position(&opportunity, cancel).await {
                opened += 1;
            }
        }
    }

    async fn collect_leverage(&self, snapshots: &[crate::model::FundingSnapshot]) -> LeverageBook {
        let mut book = LeverageBook::new();
        for snapshot in snapshots {
            let key = (
                snapshot.sample.venue.clone(),
                snapshot.sample.symbol.clone(),
            );
            if book.contains_key(&key) {
                continue;
            }
            let Some(client) = self.clients.get(&key.0) else {
                continue;
            };
            match client.get_leverage_info(&key.1).await {
                Ok(info) => {
                    book.insert(key, info.max_leverage);
                }
                Err(VenueError::Unsupported(symbol, why)) => {
                    debug!(venue = %key.0, symbol, why, "symbol not supported for leverage");
                }
                Err(e) => {
                    warn!(venue = %key.0, symbol = %key.1, error = %e,
                          "leverage query failed");
                }
            }
        }
        book
    }

    /// Open one delta-neutral pair. Returns true when a position was
    /// persisted.
    async fn open_position(
        &self,
        opportunity: &ArbitrageOpportunity,
        cancel: &CancellationToken,
    ) -> bool {
        let (Some(long_client), Some(short_client)) = (
            self.clients.get(&opportunity.long_venue),
            self.clients.get(&opportunity.short_venue),
        ) else {
            warn!(long = %opportunity.long_venue, short = %opportunity.short_venue,
                  "missing venue client; opportunity skipped");
            return false;
        };

        info!(symbol = %opportunity.symbol, long = %opportunity.long_venue,
              short = %opportunity.short_venue, divergence = %opportunity.divergence,
              net_profit_rate = %opportunity.net_profit_rate,
              "opportunity accepted; opening pair");

        let make_spec = |client: &Arc<dyn VenueClient>, venue: &VenueId, side: OrderSide| OrderSpec {
            client: client.clone(),
            symbol: opportunity.symbol.clone(),
            side,
            size_usd: self.config.target_exposure_per_side_usd,
            quantity: None,
            mode: ExecutionMode::LimitWithFallback,
            limit_offset_bps: self.config.limit_offset_bps(venue),
            reduce_only: false,
            timeout: self.config.order_timeout(),
        };
        let specs = vec![
            make_spec(long_client, &opportunity.long_venue, OrderSide::Buy),
            make_spec(short_client, &opportunity.short_venue, OrderSide::Sell),
        ];

        match self
            .executor
            .execute_atomically(specs, ExecOptions::open(), cancel)
            .await
        {
            Ok(result) if result.all_filled => {
                let Some(position) = self.build_position(opportunity, &result) else {
                    self.raise_alert("fill results incomplete; cannot record position");
                    return false;
                };
                match self.positions.create_position(position).await {
                    Ok(()) => {
                        self.metrics.lock().positions_opened += 1;
                        true
                    }
                    Err(e) => {
                        // Durable record failed with live fills on the
                        // venues: err toward rollback and go flat.
                        error!(error = %e,
                               "pair filled but could not be persisted; unwinding");
                        self.unwind_unpersisted(&result).await;
                        false
                    }
                }
            }
            Ok(result) if result.rollback_performed => {
                info!(cost_usd = %result.rollback_cost_usd,
                      "open rolled back cleanly; continuing");
                false
            }
            Ok(_) => {
                info!("open did not fill; nothing resting");
                false
            }
            Err(e) if e.is_recoverable() => {
                self.metrics.lock().opportunities_rejected += 1;
                info!(error = %e, "opportunity rejected");
                false
            }
            Err(e) => {
                self.metrics.lock().critical_alerts += 1;
                self.raise_alert(&format!("open left residual exposure: {e}"));
                false
            }
        }
    }

    fn build_position(
        &self,
        opportunity: &ArbitrageOpportunity,
        result: &AtomicExecutionResult,
    ) -> Option<Position> {
        let long_fill = result.fill_for(&opportunity.long_venue)?;
        let short_fill = result.fill_for(&opportunity.short_venue)?;
        let now = Utc::now();

        let make_leg = |fill: &OrderResult, side: PositionSide, entry_rate: Decimal| {
            let notional = fill.filled_notional();
            PositionLeg {
                venue: fill.venue.clone(),
                side,
                size_usd: notional,
                quantity: fill.filled_quantity,
                entry_price: fill.avg_fill_price.unwrap_or_default(),
                entry_rate,
                fees_paid_usd: self.fees.taker_fee_usd(&fill.venue, notional),
                slippage_paid_usd: fill.slippage_usd,
                leverage: Some(opportunity.max_leverage),
            }
        };
        let long_leg = make_leg(long_fill, PositionSide::Long, opportunity.long_rate);
        let short_leg = make_leg(short_fill, PositionSide::Short, opportunity.short_rate);
        let total_fees = long_leg.fees_paid_usd + short_leg.fees_paid_usd;

        Some(Position {
            id: Uuid::new_v4(),
            strategy: STRATEGY_FUNDING_ARB.to_string(),
            account_id: self.config.account_id.clone(),
            symbol: opportunity.symbol.clone(),
            long_leg,
            short_leg,
            size_usd: self.config.target_exposure_per_side_usd,
            entry_divergence: opportunity.divergence,
            current_divergence: opportunity.divergence,
            opened_at: now,
            last_check_at: now,
            status: PositionStatus::Open,
            exit_reason: None,
            closed_at: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_paid_usd: total_fees,
            realized_pnl_usd: None,
            needs_reconciliation: false,
        })
    }

    /// Best-effort flattening of fills that could not be recorded durably.
    async fn unwind_unpersisted(&self, result: &AtomicExecutionResult) {
        for fill in &result.filled_orders {
            let Some(client) = self.clients.get(&fill.venue) else {
                self.raise_alert(&format!("cannot unwind fill on {}: no client", fill.venue));
                continue;
            };
            let side = fill.side.opposite();
            match client
                .place_market(&fill.symbol, side, fill.filled_quantity, true)
                .await
            {
                Ok(order_id) => {
                    debug!(venue = %fill.venue, order_id, "unwind order placed");
                }
                Err(e) => {
                    self.raise_alert(&format!(
                        "unwind of unpersisted fill on {} failed: {e}",
                        fill.venue
                    ));
                }
            }
        }
    }

    /// Critical operator alert: logged loudly and trips the kill switch.
    fn raise_alert(&self, message: &str) {
        self.halt_opens.store(true, Ordering::SeqCst);
        error!(alert = true, "{message}");
    }
}
