use clap::Parser;
use pshadow::{
    agents::Agents,
    config::JobConfig,
    coordinator::Coordinator,
    event,
    matches::StaticMatches,
    store::StoreAdapters,
};
use std::{path::PathBuf, process};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::{OptionExt, ResultExt};

/// Coordinates one multi-node job across its execution slots
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// job configuration (YAML)
    config: PathBuf,

    /// reattach to the nodes recorded in the job store instead of starting them
    #[arg(long)]
    reconnect: bool,

    /// more verbose logging, RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = JobConfig::load(&cli.config).unwrap_or_log();
    if config.preflight_checks() {
        error!("Configuration has errors, please fix them and try again");
        process::exit(1);
    }

    let (sender, receiver) = event::channel();
    let agent = Agents::load(&config.agent, sender).unwrap_or_log();
    let store = StoreAdapters::load(&config.store, config.job.cluster, config.job.proc)
        .unwrap_or_log();
    let matches = StaticMatches::new(config.slots.clone(), config.job.attributes.clone());
    let settings = config.settings();

    let mut coordinator = if cli.reconnect {
        let mut coordinator = Coordinator::restore(
            settings,
            config.job.attributes.clone(),
            agent,
            matches,
            store,
        )
        .unwrap_or_log();
        coordinator.reconnect();

        coordinator
    } else {
        let rank0 = config.rank0().cloned().expect_or_log("rank 0 has a slot");
        let mut coordinator = Coordinator::new(
            settings,
            config.job.attributes.clone(),
            rank0,
            agent,
            matches,
            store,
        );
        coordinator.spawn();

        coordinator
    };

    let outcome = coordinator.run(&receiver).unwrap_or_log();
    let exit_reason = coordinator.exit_reason();
    info!(
        "Job {}.{} {}",
        config.job.cluster,
        config.job.proc,
        outcome.disposition()
    );

    match serde_yaml::to_string(&outcome) {
        Ok(document) => print!("{document}"),
        Err(error) => warn!("Failed to serialize job outcome: {error}"),
    }

    if let Err(error) = coordinator.into_store().close() {
        warn!(error = ?error, "Failed to close job store: {error}");
    }

    process::exit(exit_reason.map_or(1, |reason| reason as i32));
}
