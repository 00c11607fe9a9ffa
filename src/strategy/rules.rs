//! Pluggable exit triggers evaluated against each live position every cycle.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{ExitReason, Position};

/// How fast the exit has to happen. Urgent exits skip the limit phase and
/// go straight to market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Normal,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTrigger {
    pub urgency: Urgency,
    pub reason: ExitReason,
}

/// One exit rule. Evaluation is pure: same position and clock, same answer.
pub trait RebalanceRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, position: &Position, now: DateTime<Utc>) -> Option<RuleTrigger>;
}

/// Which rule the strategy wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Erosion,
    Flip,
    Age,
    #[default]
    Combined,
}

/// Exit when the divergence has decayed below `threshold` of its value at
/// entry.
pub struct ProfitErosionRule {
    pub threshold: Decimal,
}

impl RebalanceRule for ProfitErosionRule {
    fn name(&self) -> &'static str {
        "profit_erosion"
    }

    fn evaluate(&self, position: &Position, _now: DateTime<Utc>) -> Option<RuleTrigger> {
        let ratio = position.erosion_ratio()?;
        if ratio < self.threshold {
            Some(RuleTrigger {
                urgency: Urgency::Normal,
                reason: ExitReason::ProfitErosion,
            })
        } else {
            None
        }
    }
}

/// Exit the moment the pair stops paying.
pub struct DivergenceFlipRule;

impl RebalanceRule for DivergenceFlipRule {
    fn name(&self) -> &'static str {
        "divergence_flip"
    }

    fn evaluate(&self, position: &Position, _now: DateTime<Utc>) -> Option<RuleTrigger> {
        if position.current_divergence <= Decimal::ZERO {
            Some(RuleTrigger {
                urgency: Urgency::Urgent,
                reason: ExitReason::DivergenceFlip,
            })
        } else {
            None
        }
    }
}

/// Exit positions older than `max_age` regardless of the divergence.
pub struct AgeRule {
    pub max_age: Duration,
}

impl RebalanceRule for AgeRule {
    fn name(&self) -> &'static str {
        "age"
    }

    fn evaluate(&self, position: &Position, now: DateTime<Utc>) -> Option<RuleTrigger> {
        if position.age(now) > self.max_age {
            Some(RuleTrigger {
                urgency: Urgency::Normal,
                reason: ExitReason::MaxAge,
            })
        } else {
            None
        }
    }
}

/// OR-combination: fires when any member fires. Urgent beats normal; among
/// equal urgency the first rule in configured order supplies the reason.
pub struct CombinedRule {
    rules: Vec<Box<dyn RebalanceRule>>,
}

impl CombinedRule {
    pub fn new(rules: Vec<Box<dyn RebalanceRule>>) -> Self {
        CombinedRule { rules }
    }
}

impl RebalanceRule for CombinedRule {
    fn name(&self) -> &'static str {
        "combined"
    }

    fn evaluate(&self, position: &Position, now: DateTime<Utc>) -> Option<RuleTrigger> {
        let mut best: Option<RuleTrigger> = None;
        for rule in &self.rules {
            if let Some(trigger) = rule.evaluate(position, now) {
                match best {
                    // Strictly-greater keeps the first rule among ties.
                    Some(current) if trigger.urgency <= current.urgency => {}
                    _ => best = Some(trigger),
                }
            }
        }
        best
    }
}

/// Wire up the configured rule.
pub fn build_rule(
    kind: RuleKind,
    erosion_threshold: Decimal,
    max_age: Duration,
) -> Box<dyn RebalanceRule> {
    match kind {
        RuleKind::Erosion => Box::new(ProfitErosionRule {
            threshold: erosion_threshold,
        }),
        RuleKind::Flip => Box::new(DivergenceFlipRule),
        RuleKind::Age => Box::new(AgeRule { max_age }),
        RuleKind::Combined => Box::new(CombinedRule::new(vec![
            Box::new(DivergenceFlipRule),
            Box::new(ProfitErosionRule {
                threshold: erosion_threshold,
            }),
            Box::new(AgeRule { max_age }),
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PositionLeg, PositionSide, PositionStatus, Symbol, VenueId};
    use uuid::Uuid;

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
            fees_paid_usd: Decimal::ZERO,
            slippage_paid_usd: Decimal::ZERO,
            leverage: None,
        }
    }

    fn position(entry: &str, current: &str, age_hours: i64) -> Position {
        let now = Utc::now();
        Position {
            id: Uuid::new_v4(),
            strategy: crate::model::position::STRATEGY_FUNDING_ARB.to_string(),
            account_id: None,
            symbol: Symbol::new("BTC"),
            long_leg: leg("v1", PositionSide::Long),
            short_leg: leg("v2", PositionSide::Short),
            size_usd: d("1000"),
            entry_divergence: d(entry),
            current_divergence: d(current),
            opened_at: now - Duration::hours(age_hours),
            last_check_at: now,
            status: PositionStatus::Open,
            exit_reason: None,
            closed_at: None,
            cumulative_funding_usd: Decimal::ZERO,
            total_fees_paid_usd: Decimal::ZERO,
            realized_pnl_usd: None,
            needs_reconciliation: false,
        }
    }

    #[test]
    fn erosion_fires_below_threshold() {
        let rule = ProfitErosionRule { threshold: d("0.5") };
        // 0.0006 / 0.0014 = 0.43
        let trigger = rule.evaluate(&position("0.0014", "0.0006", 1), Utc::now()).unwrap();
        assert_eq!(trigger.urgency, Urgency::Normal);
        assert_eq!(trigger.reason, ExitReason::ProfitErosion);
        assert!(rule.evaluate(&position("0.0014", "0.0008", 1), Utc::now()).is_none());
    }

    #[test]
    fn flip_fires_urgent_at_zero_or_below() {
        let rule = DivergenceFlipRule;
        let trigger = rule.evaluate(&position("0.0014", "-0.0004", 1), Utc::now()).unwrap();
        assert_eq!(trigger.urgency, Urgency::Urgent);
        assert!(rule.evaluate(&position("0.0014", "0", 1), Utc::now()).is_some());
        assert!(rule.evaluate(&position("0.0014", "0.0001", 1), Utc::now()).is_none());
    }

    #[test]
    fn age_fires_past_max_age() {
        let rule = AgeRule { max_age: Duration::hours(168) };
        assert!(rule.evaluate(&position("0.0014", "0.0014", 169), Utc::now()).is_some());
        assert!(rule.evaluate(&position("0.0014", "0.0014", 167), Utc::now()).is_none());
    }

    #[test]
    fn combined_prefers_urgent_then_first_configured() {
        let rule = build_rule(RuleKind::Combined, d("0.5"), Duration::hours(168));

        // Both erosion and flip would fire; flip is urgent and wins.
        let trigger = rule.evaluate(&position("0.0014", "-0.0004", 1), Utc::now()).unwrap();
        assert_eq!(trigger.reason, ExitReason::DivergenceFlip);
        assert_eq!(trigger.urgency, Urgency::Urgent);

        // Erosion and age both normal; erosion is configured first.
        let trigger = rule.evaluate(&position("0.0014", "0.0006", 169), Utc::now()).unwrap();
        assert_eq!(trigger.reason, ExitReason::ProfitErosion);

        // Determinism: identical inputs, identical answer.
        let a = rule.evaluate(&position("0.0014", "0.0006", 169), Utc::now()).unwrap();
        assert_eq!(a, trigger);
    }
}
