use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Delta-neutral funding-rate arbitrage across perpetual futures venues.
#[derive(Parser)]
#[command(name = "fundarb", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the strategy loop
    Run {
        /// Path to the JSON config file
        #[arg(long, default_value = "fundarb.json")]
        config: PathBuf,

        /// Pre-flight only: scan and check feasibility, place nothing
        #[arg(long)]
        dry_run: bool,

        /// Run a single monitor/exit/scan tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Print open positions and lifetime results from the database
    Status {
        /// Path to the JSON config file
        #[arg(long, default_value = "fundarb.json")]
        config: PathBuf,
    },
}
