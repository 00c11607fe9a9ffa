use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{
    ExitReason, FundingPayment, Position, PositionSide, PositionStatus, Symbol, VenueId,
};
use crate::store::{PositionStore, StoreResult};
use crate::venue::VenueClient;

/// Single source of truth for live inventory.
///
/// All mutations flow through here and hit the database before the in-memory
/// map, so a crash between the two leaves the durable copy ahead, never
/// behind. The map is rebuilt from the store on startup.
pub struct PositionManager {
    store: PositionStore,
    live: Mutex<HashMap<Uuid, Position>>,
}

impl PositionManager {
    pub fn new(store: PositionStore) -> Self {
        PositionManager {
            store,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory map from every non-closed row.
    pub async fn load(&self) -> StoreResult<usize> {
        let rows = self.store.load_non_closed().await?;
        let mut live = self.live.lock().await;
        live.clear();
        for position in rows {
            live.insert(position.id, position);
        }
        Ok(live.len())
    }

    /// Compare each live record against the venues' actual positions.
    ///
    /// A leg whose live quantity differs from the recorded one by more than
    /// the venue's size step is flagged for operator review, never silently
    /// repaired. Returns the ids that were flagged.
    pub async fn reconcile(
        &self,
        clients: &HashMap<VenueId, Arc<dyn VenueClient>>,
    ) -> StoreResult<Vec<Uuid>> {
        let snapshot: Vec<Position> = self.live.lock().await.values().cloned().collect();
        let mut flagged = Vec::new();

        for position in snapshot {
            let mut mismatch = false;
            for leg in [&position.long_leg, &position.short_leg] {
                let Some(client) = clients.get(&leg.venue) else {
                    warn!(position = %position.id, venue = %leg.venue,
                          "no client for recorded venue; cannot reconcile");
                    mismatch = true;
                    continue;
                };
                let live = match client.get_position(&position.symbol).await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(position = %position.id, venue = %leg.venue, error = %e,
                              "venue unreachable during reconciliation");
                        mismatch = true;
                        continue;
                    }
                };
                let expected = match leg.side {
                    PositionSide::Long => leg.quantity,
                    PositionSide::Short => -leg.quantity,
                };
                let step = client
                    .size_step(&position.symbol)
                    .unwrap_or(Decimal::ZERO)
                    .max(Decimal::new(1, 9));
                if (live.quantity - expected).abs() > step {
                    error!(position = %position.id, venue = %leg.venue,
                           expected = %expected, live = %live.quantity,
                           "recorded leg does not match venue position");
                    mismatch = true;
                }
            }
            if mismatch {
                self.set_needs_reconciliation(position.id, true).await?;
                flagged.push(position.id);
            }
        }

        if !flagged.is_empty() {
            warn!(count = flagged.len(), "positions flagged for reconciliation");
        }
        Ok(flagged)
    }

    /// Persist a freshly opened position. Uniqueness per
    /// (strategy, account, symbol, venue pair) is enforced by the store.
    pub async fn create_position(&self, position: Position) -> StoreResult<()> {
        self.store.insert(&position).await?;
        info!(position = %position.id, symbol = %position.symbol,
              long = %position.long_leg.venue, short = %position.short_leg.venue,
              size_usd = %position.size_usd, "position created");
        self.live.lock().await.insert(position.id, position);
        Ok(())
    }

    /// Refresh live monitoring metrics.
    pub async fn update_position_state(
        &self,
        id: Uuid,
        current_divergence: Decimal,
        last_check_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.store
            .update_live_metrics(id, current_divergence, last_check_at)
            .await?;
        if let Some(position) = self.live.lock().await.get_mut(&id) {
            position.current_divergence = current_divergence;
            position.last_check_at = last_check_at;
        }
        Ok(())
    }

    /// Append a funding payment; the store bumps the cumulative total in the
    /// same transaction.
    pub async fn record_funding_payment(&self, payment: FundingPayment) -> StoreResult<()> {
        self.store.record_funding_payment(&payment).await?;
        if let Some(position) = self.live.lock().await.get_mut(&payment.position_id) {
            position.cumulative_funding_usd += payment.payment_amount_usd;
        }
        Ok(())
    }

    /// Durable open -> pending_close transition. Must land before any close
    /// order is sent so a crash mid-close is resumable.
    pub async fn mark_pending_close(&self, id: Uuid, reason: ExitReason) -> StoreResult<()> {
        self.store.mark_pending_close(id, reason).await?;
        if let Some(position) = self.live.lock().await.get_mut(&id) {
            position.status = PositionStatus::PendingClose;
            position.exit_reason = Some(reason);
        }
        Ok(())
    }

    /// Durable pending_close -> closed transition; drops the row from the
    /// live map.
    pub async fn mark_closed(
        &self,
        id: Uuid,
        realized_pnl_usd: Decimal,
        exit_reason: ExitReason,
    ) -> StoreResult<()> {
        let closed_at = Utc::now();
        self.store
            .mark_closed(id, realized_pnl_usd, exit_reason, closed_at)
            .await?;
        self.live.lock().await.remove(&id);
        info!(position = %id, pnl_usd = %realized_pnl_usd, reason = %exit_reason,
              "position closed");
        Ok(())
    }

    pub async fn set_needs_reconciliation(&self, id: Uuid, flag: bool) -> StoreResult<()> {
        self.store.set_needs_reconciliation(id, flag).await?;
        if let Some(position) = self.live.lock().await.get_mut(&id) {
            position.needs_reconciliation = flag;
        }
        Ok(())
    }

    /// Copies of all positions with status `open`.
    pub async fn list_open(&self) -> Vec<Position> {
        self.list_where(|p| p.status == PositionStatus::Open).await
    }

    /// Copies of all non-closed positions (open and pending_close).
    pub async fn list_live(&self) -> Vec<Position> {
        self.list_where(|_| true).await
    }

    /// Positions stuck in pending_close (e.g. found at startup).
    pub async fn list_pending_close(&self) -> Vec<Position> {
        self.list_where(|p| p.status == PositionStatus::PendingClose)
            .await
    }

    async fn list_where(&self, keep: impl Fn(&Position) -> bool) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .live
            .lock()
            .await
            .values()
            .filter(|p| keep(p))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.opened_at);
        out
    }

    /// Whether a live pair already exists for (symbol, long venue, short venue).
    pub async fn has_live_pair(
        &self,
        symbol: &Symbol,
        long_venue: &VenueId,
        short_venue: &VenueId,
    ) -> bool {
        self.live.lock().await.values().any(|p| {
            &p.symbol == symbol
                && &p.long_leg.venue == long_venue
                && &p.short_leg.venue == short_venue
        })
    }

    /// Sum of per-side notionals across all live positions.
    pub async fn total_live_notional(&self) -> Decimal {
        self.live
            .lock()
            .await
            .values()
            .map(|p| p.size_usd)
            .sum()
    }

    pub async fn get(&self, id: Uuid) -> Option<Position> {
        self.live.lock().await.get(&id).cloned()
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }
}
