pub mod positions;
pub mod rates;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

pub use positions::PositionStore;
pub use rates::FundingRateStore;

/// Shared handle to the sqlite connection. All multi-row writes take the
/// lock once and run inside an explicit transaction.
pub type Db = Arc<Mutex<Connection>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal status transition: {0}")]
    InvalidTransition(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Open (or create) the database at `path`, applying pragmas and migrations.
pub fn open(path: &Path) -> StoreResult<Db> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Corrupt(format!("creating db directory: {e}")))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_in_memory() -> StoreResult<Db> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn migrate(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS positions (
            id                      TEXT PRIMARY KEY,
            strategy                TEXT NOT NULL,
            account_id              TEXT,
            symbol                  TEXT NOT NULL,
            long_venue              TEXT NOT NULL,
            long_size_usd           TEXT NOT NULL,
            long_quantity           TEXT NOT NULL,
            long_entry_price        TEXT NOT NULL,
            long_entry_rate         TEXT NOT NULL,
            long_fees_usd           TEXT NOT NULL,
            long_slippage_usd       TEXT NOT NULL,
            long_leverage           TEXT,
            short_venue             TEXT NOT NULL,
            short_size_usd          TEXT NOT NULL,
            short_quantity          TEXT NOT NULL,
            short_entry_price       TEXT NOT NULL,
            short_entry_rate        TEXT NOT NULL,
            short_fees_usd          TEXT NOT NULL,
            short_slippage_usd      TEXT NOT NULL,
            short_leverage          TEXT,
            size_usd                TEXT NOT NULL,
            entry_divergence        TEXT NOT NULL,
            current_divergence      TEXT NOT NULL,
            opened_at               TEXT NOT NULL,
            last_check_at           TEXT NOT NULL,
            status                  TEXT NOT NULL,
            exit_reason             TEXT,
            closed_at               TEXT,
            cumulative_funding_usd  TEXT NOT NULL,
            total_fees_paid_usd     TEXT NOT NULL,
            realized_pnl_usd        TEXT,
            needs_reconciliation    INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

        CREATE TABLE IF NOT EXISTS funding_payments (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            position_id         TEXT NOT NULL REFERENCES positions(id),
            venue               TEXT NOT NULL,
            symbol              TEXT NOT NULL,
            funding_rate        TEXT NOT NULL,
            payment_amount_usd  TEXT NOT NULL,
            payment_time        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_funding_payments_position
            ON funding_payments(position_id);
        CREATE INDEX IF NOT EXISTS idx_funding_payments_venue_time
            ON funding_payments(venue, payment_time);

        CREATE TABLE IF NOT EXISTS funding_rates (
            venue              TEXT NOT NULL,
            symbol             TEXT NOT NULL,
            raw_rate           TEXT NOT NULL,
            interval_hours     INTEGER NOT NULL,
            next_funding_time  TEXT,
            observed_at        TEXT NOT NULL,
            volume_24h_usd     TEXT NOT NULL DEFAULT '0',
            open_interest_usd  TEXT NOT NULL DEFAULT '0',
            PRIMARY KEY (venue, symbol, observed_at)
        );
        ",
    )?;
    Ok(())
}

// ── Row conversion helpers ──────────────────────────────────────────

/// Fixed-width RFC3339 so the TEXT columns sort chronologically.
pub(crate) fn fmt_datetime(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_decimal(field: &str, raw: &str) -> StoreResult<rust_decimal::Decimal> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{field}: '{raw}' is not a decimal ({e})")))
}

pub(crate) fn parse_decimal_opt(
    field: &str,
    raw: Option<String>,
) -> StoreResult<Option<rust_decimal::Decimal>> {
    raw.map(|s| parse_decimal(field, &s)).transpose()
}

pub(crate) fn parse_datetime(field: &str, raw: &str) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("{field}: '{raw}' is not a timestamp ({e})")))
}

pub(crate) fn parse_datetime_opt(
    field: &str,
    raw: Option<String>,
) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|s| parse_datetime(field, &s)).transpose()
}
