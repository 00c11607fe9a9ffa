//! Binary-side wiring: config to running strategy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fundarb::config::ArbConfig;
use fundarb::exec::AtomicExecutor;
use fundarb::market::PriceCache;
use fundarb::model::{Symbol, VenueId};
use fundarb::position::PositionManager;
use fundarb::store::{self, FundingRateStore, PositionStore};
use fundarb::strategy::FundingArbStrategy;
use fundarb::venue::VenueClient;
use fundarb::venue::paper::{PaperVenue, PaperVenueConfig};

/// Entry point for the `run` command.
pub fn run(config_path: &Path, dry_run: bool, once: bool) -> Result<()> {
    let mut config = ArbConfig::load(config_path)?;
    if dry_run {
        config.dry_run = true;
    }
    info!(
        venues = ?config.whitelisted_venues,
        target_per_side = %config.target_exposure_per_side_usd,
        dry_run = config.dry_run,
        once,
        "starting funding-arb strategy"
    );

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async(config, once))
}

async fn run_async(config: ArbConfig, once: bool) -> Result<()> {
    let db = store::open(&config.database_path).context("opening database")?;
    let positions = Arc::new(PositionManager::new(PositionStore::new(db.clone())));
    let rates = FundingRateStore::new(db);
    let cache = Arc::new(PriceCache::new());
    let executor = Arc::new(AtomicExecutor::new(cache, config.executor_config()));

    let clients = build_clients(&config);
    if clients.is_empty() {
        bail!("no venue clients connected; nothing to trade against");
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    let strategy = FundingArbStrategy::new(config, clients, executor, positions, rates);
    strategy.run(shutdown, once).await
}

/// Wire one client per whitelisted venue.
///
/// This binary only knows how to construct paper venues (from the config's
/// `paper` sections); real venue clients are injected by embedding the
/// library and handing `FundingArbStrategy::new` your own implementations.
fn build_clients(config: &ArbConfig) -> HashMap<VenueId, Arc<dyn VenueClient>> {
    let mut clients: HashMap<VenueId, Arc<dyn VenueClient>> = HashMap::new();
    for venue in &config.whitelisted_venues {
        let venue_config = config.venue_config(venue);
        let Some(paper) = venue_config.paper else {
            warn!(venue = %venue,
                  "no paper market configured; venue skipped (embed the library to wire a real client)");
            continue;
        };

        let mut cfg = PaperVenueConfig::new(venue.as_str());
        cfg.tick_size = paper.tick_size;
        cfg.size_step = paper.size_step;
        cfg.max_leverage = paper.max_leverage;
        cfg.seed = paper.seed;
        let client = PaperVenue::new(cfg);
        for (symbol, mid) in &paper.mid_prices {
            client.seed_book(
                Symbol::new(symbol),
                *mid,
                paper.spread_bps,
                paper.depth_levels,
                paper.level_size,
            );
        }
        clients.insert(venue.clone(), Arc::new(client));
    }
    clients
}

/// Entry point for the `status` command.
pub fn status(config_path: &Path) -> Result<()> {
    let config = ArbConfig::load(config_path)?;
    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(async {
        let db = store::open(&config.database_path).context("opening database")?;
        let positions = PositionStore::new(db);

        let live = positions.load_non_closed().await?;
        println!("Live positions: {}", live.len());
        for p in &live {
            println!(
                "  {} {} long {} / short {}  ${} per side  divergence {} -> {}  status {}{}",
                p.id,
                p.symbol,
                p.long_leg.venue,
                p.short_leg.venue,
                p.size_usd,
                p.entry_divergence,
                p.current_divergence,
                p.status,
                if p.needs_reconciliation {
                    "  [NEEDS RECONCILIATION]"
                } else {
                    ""
                },
            );
            println!(
                "      funding ${}  fees ${}  opened {}",
                p.cumulative_funding_usd, p.total_fees_paid_usd, p.opened_at,
            );
        }

        let (closed, realized) = positions.closed_stats().await?;
        println!("Closed positions: {closed}  lifetime realized PnL: ${realized}");
        Ok(())
    })
}
