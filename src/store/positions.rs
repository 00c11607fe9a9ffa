use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::model::{
    ExitReason, FundingPayment, Position, PositionLeg, PositionSide, PositionStatus, Symbol,
    VenueId,
};

use super::{
    Db, StoreError, StoreResult, fmt_datetime, parse_datetime, parse_datetime_opt, parse_decimal,
    parse_decimal_opt,
};

/// Durable home of `Position` and `FundingPayment` rows.
///
/// Liveness-affecting mutations (inserts, status transitions) go through here
/// and are committed before anyone acts on them.
#[derive(Clone)]
pub struct PositionStore {
    db: Db,
}

impl PositionStore {
    pub fn new(db: Db) -> Self {
        PositionStore { db }
    }

    /// Insert a freshly opened position. Fails with `Conflict` when a
    /// non-closed row already exists for the same
    /// (strategy, account, symbol, long venue, short venue).
    pub async fn insert(&self, position: &Position) -> StoreResult<()> {
        let conn = self.db.lock().await;
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions
             WHERE strategy = ?1 AND symbol = ?2 AND long_venue = ?3 AND short_venue = ?4
               AND COALESCE(account_id, '') = COALESCE(?5, '')
               AND status != 'closed'",
            params![
                position.strategy,
                position.symbol.as_str(),
                position.long_leg.venue.as_str(),
                position.short_leg.venue.as_str(),
                position.account_id,
            ],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Err(StoreError::Conflict(format!(
                "live position already exists for {} {}/{}",
                position.symbol, position.long_leg.venue, position.short_leg.venue
            )));
        }

        conn.execute(
            "INSERT INTO positions (
                id, strategy, account_id, symbol,
                long_venue, long_size_usd, long_quantity, long_entry_price,
                long_entry_rate, long_fees_usd, long_slippage_usd, long_leverage,
                short_venue, short_size_usd, short_quantity, short_entry_price,
                short_entry_rate, short_fees_usd, short_slippage_usd, short_leverage,
                size_usd, entry_divergence, current_divergence,
                opened_at, last_check_at, status, exit_reason, closed_at,
                cumulative_funding_usd, total_fees_paid_usd, realized_pnl_usd,
                needs_reconciliation
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                ?31, ?32
            )",
            params![
                position.id.to_string(),
                position.strategy,
                position.account_id,
                position.symbol.as_str(),
                position.long_leg.venue.as_str(),
                position.long_leg.size_usd.to_string(),
                position.long_leg.quantity.to_string(),
                position.long_leg.entry_price.to_string(),
                position.long_leg.entry_rate.to_string(),
                position.long_leg.fees_paid_usd.to_string(),
                position.long_leg.slippage_paid_usd.to_string(),
                position.long_leg.leverage.map(|l| l.to_string()),
                position.short_leg.venue.as_str(),
                position.short_leg.size_usd.to_string(),
                position.short_leg.quantity.to_string(),
                position.short_leg.entry_price.to_string(),
                position.short_leg.entry_rate.to_string(),
                position.short_leg.fees_paid_usd.to_string(),
                position.short_leg.slippage_paid_usd.to_string(),
                position.short_leg.leverage.map(|l| l.to_string()),
                position.size_usd.to_string(),
                position.entry_divergence.to_string(),
                position.current_divergence.to_string(),
                fmt_datetime(position.opened_at),
                fmt_datetime(position.last_check_at),
                position.status.as_str(),
                position.exit_reason.map(|r| r.as_str()),
                position.closed_at.map(fmt_datetime),
                position.cumulative_funding_usd.to_string(),
                position.total_fees_paid_usd.to_string(),
                position.realized_pnl_usd.map(|p| p.to_string()),
                position.needs_reconciliation as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Position>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM positions WHERE id = ?1")?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_position(row)?)),
            None => Ok(None),
        }
    }

    /// Every row not yet closed, oldest first. Used to rebuild the in-memory
    /// cache on startup.
    pub async fn load_non_closed(&self) -> StoreResult<Vec<Position>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM positions WHERE status != 'closed' ORDER BY opened_at")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_position(row)?);
        }
        Ok(out)
    }

    /// Upsert of live monitoring metrics. A no-op on closed rows.
    pub async fn update_live_metrics(
        &self,
        id: Uuid,
        current_divergence: Decimal,
        last_check_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE positions SET current_divergence = ?2, last_check_at = ?3
             WHERE id = ?1 AND status != 'closed'",
            params![
                id.to_string(),
                current_divergence.to_string(),
                fmt_datetime(last_check_at),
            ],
        )?;
        Ok(())
    }

    /// Transition open -> pending_close. Repeating the call on a row already
    /// pending is a no-op so a crashed close can be resumed.
    pub async fn mark_pending_close(&self, id: Uuid, reason: ExitReason) -> StoreResult<()> {
        let conn = self.db.lock().await;
        let status = current_status(&conn, id)?;
        match status {
            PositionStatus::Open => {
                conn.execute(
                    "UPDATE positions SET status = 'pending_close', exit_reason = ?2
                     WHERE id = ?1",
                    params![id.to_string(), reason.as_str()],
                )?;
                Ok(())
            }
            PositionStatus::PendingClose => Ok(()),
            PositionStatus::Closed => Err(StoreError::InvalidTransition(format!(
                "position {id} is closed; cannot mark pending_close"
            ))),
        }
    }

    /// Transition pending_close -> closed, freezing the row. Calling it again
    /// with identical inputs is a no-op; diverging inputs are an error.
    pub async fn mark_closed(
        &self,
        id: Uuid,
        realized_pnl_usd: Decimal,
        exit_reason: ExitReason,
        closed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.db.lock().await;
        let status = current_status(&conn, id)?;
        match status {
            PositionStatus::PendingClose => {
                conn.execute(
                    "UPDATE positions
                     SET status = 'closed', exit_reason = ?2, realized_pnl_usd = ?3,
                         closed_at = ?4
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        exit_reason.as_str(),
                        realized_pnl_usd.to_string(),
                        fmt_datetime(closed_at),
                    ],
                )?;
                Ok(())
            }
            PositionStatus::Closed => {
                let (prev_pnl, prev_reason): (Option<String>, Option<String>) = conn.query_row(
                    "SELECT realized_pnl_usd, exit_reason FROM positions WHERE id = ?1",
                    params![id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let same = prev_pnl.as_deref() == Some(realized_pnl_usd.to_string().as_str())
                    && prev_reason.as_deref() == Some(exit_reason.as_str());
                if same {
                    Ok(())
                } else {
                    Err(StoreError::InvalidTransition(format!(
                        "position {id} already closed with different outcome"
                    )))
                }
            }
            PositionStatus::Open => Err(StoreError::InvalidTransition(format!(
                "position {id} is open; close must go through pending_close"
            ))),
        }
    }

    /// Flag (or clear) the operator-attention marker.
    pub async fn set_needs_reconciliation(&self, id: Uuid, flag: bool) -> StoreResult<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE positions SET needs_reconciliation = ?2 WHERE id = ?1",
            params![id.to_string(), flag as i64],
        )?;
        Ok(())
    }

    /// Append a funding payment and bump the position's running total in one
    /// transaction. Returns the payment row id.
    pub async fn record_funding_payment(&self, payment: &FundingPayment) -> StoreResult<i64> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;

        let cumulative: String = tx
            .query_row(
                "SELECT cumulative_funding_usd FROM positions WHERE id = ?1",
                params![payment.position_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("position {}", payment.position_id))
                }
                other => StoreError::Sqlite(other),
            })?;
        let cumulative = parse_decimal("cumulative_funding_usd", &cumulative)?;
        let updated = cumulative + payment.payment_amount_usd;

        tx.execute(
            "INSERT INTO funding_payments
                 (position_id, venue, symbol, funding_rate, payment_amount_usd, payment_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                payment.position_id.to_string(),
                payment.venue.as_str(),
                payment.symbol.as_str(),
                payment.funding_rate.to_string(),
                payment.payment_amount_usd.to_string(),
                fmt_datetime(payment.payment_time),
            ],
        )?;
        let row_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE positions SET cumulative_funding_usd = ?2 WHERE id = ?1",
            params![payment.position_id.to_string(), updated.to_string()],
        )?;

        tx.commit()?;
        Ok(row_id)
    }

    /// Count and summed realized PnL of all closed positions.
    pub async fn closed_stats(&self) -> StoreResult<(u64, Decimal)> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT realized_pnl_usd FROM positions WHERE status = 'closed'",
        )?;
        let mut rows = stmt.query([])?;
        let mut count = 0u64;
        let mut total = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            count += 1;
            let raw: Option<String> = row.get(0)?;
            if let Some(raw) = raw {
                total += parse_decimal("realized_pnl_usd", &raw)?;
            }
        }
        Ok((count, total))
    }

    /// All payments recorded for a position, in payment order.
    pub async fn payments_for(&self, position_id: Uuid) -> StoreResult<Vec<FundingPayment>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, position_id, venue, symbol, funding_rate, payment_amount_usd, payment_time
             FROM funding_payments WHERE position_id = ?1 ORDER BY payment_time, id",
        )?;
        let mut rows = stmt.query(params![position_id.to_string()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_payment(row)?);
        }
        Ok(out)
    }
}

fn current_status(conn: &rusqlite::Connection, id: Uuid) -> StoreResult<PositionStatus> {
    let raw: String = conn
        .query_row(
            "SELECT status FROM positions WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("position {id}")),
            other => StoreError::Sqlite(other),
        })?;
    raw.parse().map_err(StoreError::Corrupt)
}

fn row_to_payment(row: &Row<'_>) -> StoreResult<FundingPayment> {
    let venue: String = row.get("venue")?;
    let symbol: String = row.get("symbol")?;
    let rate: String = row.get("funding_rate")?;
    let amount: String = row.get("payment_amount_usd")?;
    let time: String = row.get("payment_time")?;
    let position_id: String = row.get("position_id")?;
    Ok(FundingPayment {
        id: row.get("id")?,
        position_id: Uuid::parse_str(&position_id)
            .map_err(|e| StoreError::Corrupt(format!("position_id: {e}")))?,
        venue: VenueId::new(venue),
        symbol: Symbol::new(symbol),
        funding_rate: parse_decimal("funding_rate", &rate)?,
        payment_amount_usd: parse_decimal("payment_amount_usd", &amount)?,
        payment_time: parse_datetime("payment_time", &time)?,
    })
}

fn row_to_leg(row: &Row<'_>, side: PositionSide) -> StoreResult<PositionLeg> {
    let prefix = match side {
        PositionSide::Long => "long",
        PositionSide::Short => "short",
    };
    let col = |name: &str| format!("{prefix}_{name}");
    let venue: String = row.get(col("venue").as_str())?;
    let size: String = row.get(col("size_usd").as_str())?;
    let quantity: String = row.get(col("quantity").as_str())?;
    let entry_price: String = row.get(col("entry_price").as_str())?;
    let entry_rate: String = row.get(col("entry_rate").as_str())?;
    let fees: String = row.get(col("fees_usd").as_str())?;
    let slippage: String = row.get(col("slippage_usd").as_str())?;
    let leverage: Option<String> = row.get(col("leverage").as_str())?;
    Ok(PositionLeg {
        venue: VenueId::new(venue),
        side,
        size_usd: parse_decimal("size_usd", &size)?,
        quantity: parse_decimal("quantity", &quantity)?,
        entry_price: parse_decimal("entry_price", &entry_price)?,
        entry_rate: parse_decimal("entry_rate", &entry_rate)?,
        fees_paid_usd: parse_decimal("fees_usd", &fees)?,
        slippage_paid_usd: parse_decimal("slippage_usd", &slippage)?,
        leverage: parse_decimal_opt("leverage", leverage)?,
    })
}

fn row_to_position(row: &Row<'_>) -> StoreResult<Position> {
    let id: String = row.get("id")?;
    let symbol: String = row.get("symbol")?;
    let size: String = row.get("size_usd")?;
    let entry_divergence: String = row.get("entry_divergence")?;
    let current_divergence: String = row.get("current_divergence")?;
    let opened_at: String = row.get("opened_at")?;
    let last_check_at: String = row.get("last_check_at")?;
    let status: String = row.get("status")?;
    let exit_reason: Option<String> = row.get("exit_reason")?;
    let closed_at: Option<String> = row.get("closed_at")?;
    let cumulative: String = row.get("cumulative_funding_usd")?;
    let total_fees: String = row.get("total_fees_paid_usd")?;
    let realized: Option<String> = row.get("realized_pnl_usd")?;

    Ok(Position {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id: {e}")))?,
        strategy: row.get("strategy")?,
        account_id: row.get("account_id")?,
        symbol: Symbol::new(symbol),
        long_leg: row_to_leg(row, PositionSide::Long)?,
        short_leg: row_to_leg(row, PositionSide::Short)?,
        size_usd: parse_decimal("size_usd", &size)?,
        entry_divergence: parse_decimal("entry_divergence", &entry_divergence)?,
        current_divergence: parse_decimal("current_divergence", &current_divergence)?,
        opened_at: parse_datetime("opened_at", &opened_at)?,
        last_check_at: parse_datetime("last_check_at", &last_check_at)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        exit_reason: exit_reason
            .map(|r| r.parse::<ExitReason>().map_err(StoreError::Corrupt))
            .transpose()?,
        closed_at: parse_datetime_opt("closed_at", closed_at)?,
        cumulative_funding_usd: parse_decimal("cumulative_funding_usd", &cumulative)?,
        total_fees_paid_usd: parse_decimal("total_fees_paid_usd", &total_fees)?,
        realized_pnl_usd: parse_decimal_opt("realized_pnl_usd", realized)?,
        needs_reconciliation: row.get::<_, i64>("needs_reconciliation")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn leg(venue: &str, side: PositionSide) -> PositionLeg {
        PositionLeg {
            venue: VenueId::new(venue),
            side,
            size_usd: d("1000"),
            quantity: d("0.02"),
            entry_price: d("50000"),
            entry_rate: d("0.0001"),
            fees_paid_usd: d("0.35"),
            slippage_paid_usd: d("0.10"),
            leverage: Some(d("5")),
        }
    }

    fn sample_position() -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            strategy: crate::model::position::STRATEGY_FUNDING_ARB.to_string(),
            account_id: None,
            symbol: Symbol::new("BTC"),
            long_leg: leg("v1", PositionSide::Long),
            short_leg: leg("v2", PositionSide::Short),
            size_usd: d("1000"),
            entry_divergence: d("0.0014"),
            current_divergence: d("0.0014"),
            opened_at: now,
            last_check_at: now,
            status: PositionStatus::Open,
            exit_reason: None,
            closed_at: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_paid_usd: d("0.70"),
            realized_pnl_usd: None,
            needs_reconciliation: false,
        }
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let store = PositionStore::new(open_in_memory().unwrap());
        let position = sample_position();
        store.insert(&position).await.unwrap();
        let loaded = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(loaded, position);
    }

    #[tokio::test]
    async fn duplicate_live_pair_is_rejected() {
        let store = PositionStore::new(open_in_memory().unwrap());
        store.insert(&sample_position()).await.unwrap();
        let err = store.insert(&sample_position()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn closed_pair_does_not_block_new_open() {
        let store = PositionStore::new(open_in_memory().unwrap());
        let first = sample_position();
        store.insert(&first).await.unwrap();
        store
            .mark_pending_close(first.id, ExitReason::MaxAge)
            .await
            .unwrap();
        store
            .mark_closed(first.id, d("1.23"), ExitReason::MaxAge, Utc::now())
            .await
            .unwrap();
        store.insert(&sample_position()).await.unwrap();
    }

    #[tokio::test]
    async fn status_cannot_move_backwards() {
        let store = PositionStore::new(open_in_memory().unwrap());
        let position = sample_position();
        store.insert(&position).await.unwrap();

        // closed requires pending_close first
        let err = store
            .mark_closed(position.id, Decimal::ZERO, ExitReason::Manual, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));

        store
            .mark_pending_close(position.id, ExitReason::DivergenceFlip)
            .await
            .unwrap();
        store
            .mark_closed(position.id, d("2"), ExitReason::DivergenceFlip, Utc::now())
            .await
            .unwrap();
        let err = store
            .mark_pending_close(position.id, ExitReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn closing_twice_with_identical_inputs_is_noop() {
        let store = PositionStore::new(open_in_memory().unwrap());
        let position = sample_position();
        store.insert(&position).await.unwrap();
        store
            .mark_pending_close(position.id, ExitReason::MaxAge)
            .await
            .unwrap();
        store
            .mark_closed(position.id, d("5"), ExitReason::MaxAge, Utc::now())
            .await
            .unwrap();
        store
            .mark_closed(position.id, d("5"), ExitReason::MaxAge, Utc::now())
            .await
            .unwrap();
        let err = store
            .mark_closed(position.id, d("6"), ExitReason::MaxAge, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn funding_payment_updates_cumulative_atomically() {
        let store = PositionStore::new(open_in_memory().unwrap());
        let position = sample_position();
        store.insert(&position).await.unwrap();

        for (amount, rate) in [("1.25", "0.0008"), ("-0.40", "-0.0002")] {
            store
                .record_funding_payment(&FundingPayment {
                    id: 0,
                    position_id: position.id,
                    venue: VenueId::new("v2"),
                    symbol: Symbol::new("BTC"),
                    funding_rate: d(rate),
                    payment_amount_usd: d(amount),
                    payment_time: Utc::now(),
                })
                .await
                .unwrap();
        }

        let loaded = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(loaded.cumulative_funding_usd, d("0.85"));

        let payments = store.payments_for(position.id).await.unwrap();
        assert_eq!(payments.len(), 2);
        let replayed: Decimal = payments.iter().map(|p| p.payment_amount_usd).sum();
        assert_eq!(replayed, loaded.cumulative_funding_usd);
    }
}
