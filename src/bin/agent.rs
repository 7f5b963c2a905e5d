use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use es_hit::{config::Config, orchestrator::Orchestrator, util::shutdown_signal};
use tracing::{error, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Counts Elasticsearch hits per rule and ships them to Graphite")]
struct Args {
    /// Config file (defaults to ~/.config/es-hit/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    dotenv::dotenv().ok();

    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let filter = filter::Targets::new().with_target("es_hit", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let config = Config::load(args.config.as_deref()).context("failed to load config")?;
    let orchestrator = Orchestrator::from_config(&config)?;

    if let Err(e) = orchestrator.run(shutdown_signal()).await {
        error!("{e:#}");
        return Err(e);
    }

    Ok(())
}
