use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_config::{load_config, Config, ConfigError};
use tessera_transport::Cluster;

mod rank;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration (.json or .toml); built-in defaults when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ranks, overriding the configuration
    #[arg(short, long)]
    processes: Option<usize>,

    /// Number of simulation steps, overriding the configuration
    #[arg(short, long)]
    steps: Option<usize>,

    /// Base random seed, overriding the configuration
    #[arg(long)]
    seed: Option<u64>,
}

fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    if let Some(processes) = args.processes {
        config.processes = processes;
    }
    if let Some(steps) = args.steps {
        config.simulation.steps = steps;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            process::exit(1);
        }
    };
    match &args.config {
        Some(path) => info!("Using configuration from {}", path.display()),
        None => info!("Using built-in configuration"),
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst)) {
            warn!("Could not install Ctrl+C handler: {}", e);
        }
    }

    info!(
        "Running {} steps on {} ranks over a {:?} domain ({:?} scheme, toroidal: {})",
        config.simulation.steps,
        config.processes,
        config.domain.size,
        config.partition.scheme,
        config.domain.toroidal
    );

    let cluster = Cluster::new(config.processes).with_stall_timeout(config.stall_timeout());
    let results = match cluster.run(|comm| rank::run_rank(comm, &config, &stop)) {
        Ok(results) => results,
        Err(e) => {
            error!("Cluster failed: {}", e);
            process::exit(1);
        }
    };

    let mut failed = false;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(report) => info!("{}", report),
            Err(e) => {
                error!("Rank {} failed: {}", rank, e);
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}
