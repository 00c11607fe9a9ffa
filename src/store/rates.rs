use std::collections::HashSet;

use rusqlite::params;

use crate::model::{FundingRateSample, FundingSnapshot, Symbol, VenueId};

use super::{Db, StoreResult, fmt_datetime, parse_datetime, parse_datetime_opt, parse_decimal};

/// Read view over the funding-rate time series the external collection
/// service maintains. The core only queries it; `insert_sample` exists for
/// the collector side of the table (and for fixtures).
#[derive(Clone)]
pub struct FundingRateStore {
    db: Db,
}

impl FundingRateStore {
    pub fn new(db: Db) -> Self {
        FundingRateStore { db }
    }

    pub async fn insert_sample(&self, snapshot: &FundingSnapshot) -> StoreResult<()> {
        let s = &snapshot.sample;
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO funding_rates
                 (venue, symbol, raw_rate, interval_hours, next_funding_time,
                  observed_at, volume_24h_usd, open_interest_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                s.venue.as_str(),
                s.symbol.as_str(),
                s.raw_rate.to_string(),
                s.interval_hours,
                s.next_funding_time.map(fmt_datetime),
                fmt_datetime(s.observed_at),
                snapshot.volume_24h_usd.to_string(),
                snapshot.open_interest_usd.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent snapshot per (venue, symbol), restricted to `venues`.
    pub async fn latest_snapshots(&self, venues: &[VenueId]) -> StoreResult<Vec<FundingSnapshot>> {
        let wanted: HashSet<&str> = venues.iter().map(|v| v.as_str()).collect();
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT venue, symbol, raw_rate, interval_hours, next_funding_time,
                    observed_at, volume_24h_usd, open_interest_usd
             FROM funding_rates ORDER BY observed_at DESC",
        )?;
        let mut rows = stmt.query([])?;

        let mut seen: HashSet<(VenueId, Symbol)> = HashSet::new();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let venue: String = row.get(0)?;
            if !wanted.is_empty() && !wanted.contains(venue.as_str()) {
                continue;
            }
            let symbol: String = row.get(1)?;
            let key = (VenueId::new(&venue), Symbol::new(&symbol));
            if !seen.insert(key.clone()) {
                continue;
            }

            let raw_rate: String = row.get(2)?;
            let interval_hours: u32 = row.get(3)?;
            let next_funding: Option<String> = row.get(4)?;
            let observed_at: String = row.get(5)?;
            let volume: String = row.get(6)?;
            let oi: String = row.get(7)?;

            out.push(FundingSnapshot {
                sample: FundingRateSample::new(
                    key.0,
                    key.1,
                    parse_decimal("raw_rate", &raw_rate)?,
                    interval_hours,
                    parse_datetime_opt("next_funding_time", next_funding)?,
                    parse_datetime("observed_at", &observed_at)?,
                ),
                volume_24h_usd: parse_decimal("volume_24h_usd", &volume)?,
                open_interest_usd: parse_decimal("open_interest_usd", &oi)?,
            });
        }
        Ok(out)
    }

    /// Latest snapshot for one (venue, symbol), if any.
    pub async fn latest_for(
        &self,
        venue: &VenueId,
        symbol: &Symbol,
    ) -> StoreResult<Option<FundingSnapshot>> {
        let snapshots = self.latest_snapshots(std::slice::from_ref(venue)).await?;
        Ok(snapshots.into_iter().find(|s| &s.sample.symbol == symbol))
    }
}
