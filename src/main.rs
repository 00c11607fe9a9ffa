use clap::Parser;

mod app;
mod cli;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Run { config, dry_run, once } => app::run(&config, dry_run, once),
        cli::Command::Status { config } => app::status(&config),
    }
}
