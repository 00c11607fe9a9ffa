//! Runtime configuration: a JSON file resolved into a validated `ArbConfig`.
//!
//! Decimals are written as strings in the file so nothing passes through a
//! float on the way in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::{CloseRetryPolicy, ExecutorConfig};
use crate::model::VenueId;
use crate::strategy::fees::{FeeCalculator, VenueFees};
use crate::strategy::finder::OpportunityFilter;
use crate::strategy::rules::RuleKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArbConfig {
    #[serde(default = "defaults::database_path")]
    pub database_path: PathBuf,

    pub primary_venue: VenueId,
    pub whitelisted_venues: Vec<VenueId>,
    #[serde(default)]
    pub account_id: Option<String>,

    pub target_exposure_per_side_usd: Decimal,
    pub max_total_exposure_usd: Decimal,
    #[serde(default = "defaults::max_positions")]
    pub max_positions: usize,
    #[serde(default = "defaults::max_new_positions_per_cycle")]
    pub max_new_positions_per_cycle: usize,

    pub min_net_profit_rate: Decimal,
    pub max_open_interest_usd: Decimal,
    #[serde(default = "defaults::min_volume_24h_usd")]
    pub min_volume_24h_usd: Decimal,
    #[serde(default = "defaults::required_max_leverage")]
    pub required_max_leverage: Decimal,
    #[serde(default = "defaults::opportunity_limit")]
    pub opportunity_limit: usize,

    #[serde(default)]
    pub rebalance_rule: RuleKind,
    #[serde(default = "defaults::erosion_threshold")]
    pub erosion_threshold: Decimal,
    #[serde(default = "defaults::max_age_hours")]
    pub max_age_hours: u64,

    #[serde(default = "defaults::cycle_interval_seconds")]
    pub cycle_interval_seconds: u64,
    #[serde(default = "defaults::order_timeout_seconds")]
    pub order_timeout_seconds: u64,
    #[serde(default = "defaults::price_cache_ttl_seconds")]
    pub price_cache_ttl_seconds: u64,
    #[serde(default = "defaults::max_sample_age_seconds")]
    pub max_sample_age_seconds: i64,
    #[serde(default = "defaults::max_preflight_slippage_bps")]
    pub max_preflight_slippage_bps: Decimal,

    #[serde(default)]
    pub close_retry_policy: CloseRetryPolicy,
    /// Must stay true: partial opens are always rolled back.
    #[serde(default = "defaults::rollback_on_partial")]
    pub rollback_on_partial: bool,
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub venues: HashMap<String, VenueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    /// Limit-order offset from the touch; positive rests inside the spread.
    #[serde(default = "defaults::limit_offset_bps")]
    pub limit_offset_bps: Decimal,
    #[serde(default = "defaults::taker_fee_bps")]
    pub taker_fee_bps: Decimal,
    #[serde(default = "defaults::maker_fee_bps")]
    pub maker_fee_bps: Decimal,
    /// Present when this venue should be wired as an in-memory paper venue.
    #[serde(default)]
    pub paper: Option<PaperMarketConfig>,
}

impl Default for VenueConfig {
    fn default() -> Self {
        VenueConfig {
            limit_offset_bps: defaults::limit_offset_bps(),
            taker_fee_bps: defaults::taker_fee_bps(),
            maker_fee_bps: defaults::maker_fee_bps(),
            paper: None,
        }
    }
}

/// Seed data for a paper venue's books.
#[derive(Debug, Clone, Deserialize)]
pub struct PaperMarketConfig {
    /// Mid price per canonical symbol.
    pub mid_prices: HashMap<String, Decimal>,
    #[serde(default = "defaults::spread_bps")]
    pub spread_bps: Decimal,
    #[serde(default = "defaults::depth_levels")]
    pub depth_levels: usize,
    /// Base units resting at each level.
    #[serde(default = "defaults::level_size")]
    pub level_size: Decimal,
    #[serde(default = "defaults::tick_size")]
    pub tick_size: Decimal,
    #[serde(default = "defaults::size_step")]
    pub size_step: Decimal,
    #[serde(default = "defaults::max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default = "defaults::seed")]
    pub seed: u64,
}

mod defaults {
    use std::path::PathBuf;

    use rust_decimal::Decimal;

    pub fn database_path() -> PathBuf {
        PathBuf::from("fundarb.db")
    }
    pub fn max_positions() -> usize {
        5
    }
    pub fn max_new_positions_per_cycle() -> usize {
        1
    }
    pub fn min_volume_24h_usd() -> Decimal {
        Decimal::ZERO
    }
    pub fn required_max_leverage() -> Decimal {
        Decimal::ONE
    }
    pub fn opportunity_limit() -> usize {
        10
    }
    pub fn erosion_threshold() -> Decimal {
        Decimal::new(5, 1) // 0.5
    }
    pub fn max_age_hours() -> u64 {
        168
    }
    pub fn cycle_interval_seconds() -> u64 {
        60
    }
    pub fn order_timeout_seconds() -> u64 {
        30
    }
    pub fn price_cache_ttl_seconds() -> u64 {
        5
    }
    pub fn max_sample_age_seconds() -> i64 {
        900
    }
    pub fn max_preflight_slippage_bps() -> Decimal {
        Decimal::from(25)
    }
    pub fn rollback_on_partial() -> bool {
        true
    }
    pub fn limit_offset_bps() -> Decimal {
        Decimal::ONE
    }
    pub fn taker_fee_bps() -> Decimal {
        Decimal::from(5)
    }
    pub fn maker_fee_bps() -> Decimal {
        Decimal::TWO
    }
    pub fn spread_bps() -> Decimal {
        Decimal::TWO
    }
    pub fn depth_levels() -> usize {
        20
    }
    pub fn level_size() -> Decimal {
        Decimal::ONE
    }
    pub fn tick_size() -> Decimal {
        Decimal::new(1, 2) // 0.01
    }
    pub fn size_step() -> Decimal {
        Decimal::new(1, 4) // 0.0001
    }
    pub fn max_leverage() -> Decimal {
        Decimal::from(20)
    }
    pub fn seed() -> u64 {
        7
    }
}

impl ArbConfig {
    /// Read, parse, apply environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: ArbConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if let Ok(db) = std::env::var("FUNDARB_DB") {
            config.database_path = PathBuf::from(db);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.whitelisted_venues.is_empty() {
            return Err(ConfigError::Invalid("whitelisted_venues is empty".into()));
        }
        if !self.whitelisted_venues.contains(&self.primary_venue) {
            return Err(ConfigError::Invalid(format!(
                "primary_venue '{}' is not in whitelisted_venues",
                self.primary_venue
            )));
        }
        if self.target_exposure_per_side_usd <= Decimal::ZERO {
            return Err(ConfigError::Invalid(
                "target_exposure_per_side_usd must be positive".into(),
            ));
        }
        if self.max_total_exposure_usd < self.target_exposure_per_side_usd {
            return Err(ConfigError::Invalid(
                "max_total_exposure_usd is below one position's exposure".into(),
            ));
        }
        if self.max_positions < 1 || self.max_new_positions_per_cycle < 1 {
            return Err(ConfigError::Invalid(
                "max_positions and max_new_positions_per_cycle must be >= 1".into(),
            ));
        }
        if self.erosion_threshold <= Decimal::ZERO || self.erosion_threshold > Decimal::ONE {
            return Err(ConfigError::Invalid(
                "erosion_threshold must be in (0, 1]".into(),
            ));
        }
        if self.cycle_interval_seconds == 0 || self.order_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "cycle_interval_seconds and order_timeout_seconds must be positive".into(),
            ));
        }
        // Leaving partial opens in place is one-sided exposure; there is no
        // safe reading of this flag for a funding-arb open.
        if !self.rollback_on_partial {
            return Err(ConfigError::Invalid(
                "rollback_on_partial=false is unsafe and not supported".into(),
            ));
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_seconds)
    }

    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.price_cache_ttl_seconds)
    }

    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_age_hours as i64)
    }

    pub fn max_sample_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_sample_age_seconds)
    }

    pub fn venue_config(&self, venue: &VenueId) -> VenueConfig {
        self.venues.get(venue.as_str()).cloned().unwrap_or_default()
    }

    pub fn limit_offset_bps(&self, venue: &VenueId) -> Decimal {
        self.venue_config(venue).limit_offset_bps
    }

    pub fn fee_calculator(&self) -> FeeCalculator {
        let by_venue = self
            .venues
            .iter()
            .map(|(name, v)| {
                (
                    VenueId::new(name),
                    VenueFees {
                        taker_bps: v.taker_fee_bps,
                        maker_bps: v.maker_fee_bps,
                    },
                )
            })
            .collect();
        FeeCalculator::new(by_venue)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            price_cache_ttl: self.price_cache_ttl(),
            max_preflight_slippage_bps: self.max_preflight_slippage_bps,
            rollback_timeout: self.order_timeout(),
            close_retry: self.close_retry_policy,
            dry_run: self.dry_run,
            ..ExecutorConfig::default()
        }
    }

    pub fn opportunity_filter(&self) -> OpportunityFilter {
        OpportunityFilter {
            min_net_profit_rate: self.min_net_profit_rate,
            max_open_interest_usd: self.max_open_interest_usd,
            min_volume_24h_usd: self.min_volume_24h_usd,
            required_max_leverage: self.required_max_leverage,
            max_sample_age: self.max_sample_age(),
            limit: self.opportunity_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "primary_venue": "paper-a",
            "whitelisted_venues": ["paper-a", "paper-b"],
            "target_exposure_per_side_usd": "1000",
            "max_total_exposure_usd": "10000",
            "min_net_profit_rate": "0.0005",
            "max_open_interest_usd": "50000000"
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ArbConfig = serde_json::from_value(minimal_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cycle_interval_seconds, 60);
        assert_eq!(config.order_timeout_seconds, 30);
        assert_eq!(config.erosion_threshold, Decimal::new(5, 1));
        assert_eq!(config.max_age_hours, 168);
        assert!(config.rollback_on_partial);
    }

    #[test]
    fn rollback_opt_out_is_rejected() {
        let mut raw = minimal_json();
        raw["rollback_on_partial"] = serde_json::json!(false);
        let config: ArbConfig = serde_json::from_value(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn primary_must_be_whitelisted() {
        let mut raw = minimal_json();
        raw["primary_venue"] = serde_json::json!("elsewhere");
        let config: ArbConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
