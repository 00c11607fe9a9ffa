use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::symbol::{Symbol, VenueId};

/// Strategy tag stored on every position row.
pub const STRATEGY_FUNDING_ARB: &str = "funding_arbitrage";

/// Direction of a position leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(format!("unknown position side '{other}'")),
        }
    }
}

/// Lifecycle state of a position. Transitions are strictly
/// open -> pending_close -> closed; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PendingClose,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::PendingClose => "pending_close",
            PositionStatus::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: PositionStatus) -> bool {
        matches!(
            (self, next),
            (PositionStatus::Open, PositionStatus::PendingClose)
                | (PositionStatus::PendingClose, PositionStatus::Closed)
        )
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "pending_close" => Ok(PositionStatus::PendingClose),
            "closed" => Ok(PositionStatus::Closed),
            other => Err(format!("unknown position status '{other}'")),
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitErosion,
    DivergenceFlip,
    MaxAge,
    Shutdown,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::ProfitErosion => "profit_erosion",
            ExitReason::DivergenceFlip => "divergence_flip",
            ExitReason::MaxAge => "max_age",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Manual => "manual",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profit_erosion" => Ok(ExitReason::ProfitErosion),
            "divergence_flip" => Ok(ExitReason::DivergenceFlip),
            "max_age" => Ok(ExitReason::MaxAge),
            "shutdown" => Ok(ExitReason::Shutdown),
            "manual" => Ok(ExitReason::Manual),
            other => Err(format!("unknown exit reason '{other}'")),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a delta-neutral pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLeg {
    pub venue: VenueId,
    pub side: PositionSide,
    /// Notional at entry.
    pub size_usd: Decimal,
    /// Base units held on the venue.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// Normalized funding rate on this venue at entry.
    pub entry_rate: Decimal,
    pub fees_paid_usd: Decimal,
    pub slippage_paid_usd: Decimal,
    pub leverage: Option<Decimal>,
}

impl PositionLeg {
    /// Current notional exposure of the leg at entry prices.
    pub fn exposure_usd(&self) -> Decimal {
        self.size_usd
    }
}

/// A delta-neutral funding-arbitrage pair. Owned exclusively by the
/// position manager; everything else sees copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub strategy: String,
    pub account_id: Option<String>,
    pub symbol: Symbol,
    pub long_leg: PositionLeg,
    pub short_leg: PositionLeg,
    /// Nominal notional per side.
    pub size_usd: Decimal,
    pub entry_divergence: Decimal,
    pub current_divergence: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_check_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub cumulative_funding_usd: Decimal,
    pub total_fees_paid_usd: Decimal,
    pub realized_pnl_usd: Option<Decimal>,
    /// Set when live venue quantities no longer match the recorded legs and
    /// an operator has to look. Never cleared automatically.
    pub needs_reconciliation: bool,
}

impl Position {
    pub fn is_live(&self) -> bool {
        self.status != PositionStatus::Closed
    }

    /// Ratio of the current divergence to the divergence at entry.
    /// `None` when the entry divergence is zero.
    pub fn erosion_ratio(&self) -> Option<Decimal> {
        if self.entry_divergence == Decimal::ZERO {
            None
        } else {
            Some(self.current_divergence / self.entry_divergence)
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }

    /// The venues this pair spans, long first.
    pub fn venues(&self) -> (&VenueId, &VenueId) {
        (&self.long_leg.venue, &self.short_leg.venue)
    }
}

/// A single per-venue funding credit or debit attributed to a position.
/// Append-only; `Position::cumulative_funding_usd` is the running sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    /// Database row id; zero until persisted.
    pub id: i64,
    pub position_id: Uuid,
    pub venue: VenueId,
    pub symbol: Symbol,
    pub funding_rate: Decimal,
    /// Positive when the venue credited us, negative when it debited.
    pub payment_amount_usd: Decimal,
    pub payment_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        use PositionStatus::*;
        assert!(Open.can_transition_to(PendingClose));
        assert!(PendingClose.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!PendingClose.can_transition_to(Open));
        assert!(!Closed.can_transition_to(PendingClose));
    }

    #[test]
    fn exit_reason_round_trips_through_str() {
        for reason in [
            ExitReason::ProfitErosion,
            ExitReason::DivergenceFlip,
            ExitReason::MaxAge,
            ExitReason::Shutdown,
            ExitReason::Manual,
        ] {
            assert_eq!(reason.as_str().parse::<ExitReason>().unwrap(), reason);
        }
    }
}
