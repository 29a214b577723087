//! testgridd — the TestGrid daemon.
//!
//! Assembles a coordinator from a `testgrid.toml` and drives it with
//! simulated workers, or inspects configuration files.
//!
//! # Usage
//!
//! ```text
//! testgridd simulate --workers 4 --tasks 200 --seed 7 --failure-rate 0.05
//! testgridd --log-format json simulate --config testgrid.toml --autoscale
//! testgridd config show
//! testgridd config check testgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use testgrid_autoscale::FleetProvider;
use testgrid_balancer::Strategy;
use testgrid_coordinator::sim::{
    SimulatedExecutor, SimulatedFleet, fleet_capabilities, generate_plan, sim_workers, spawn_heartbeats,
};
use testgrid_coordinator::{Coordinator, GridConfig};
use testgrid_core::time::parse_duration;
use testgrid_registry::WorkerRegistry;

#[derive(Parser)]
#[command(name = "testgridd", about = "TestGrid coordinator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a generated test plan against simulated workers and print the
    /// results as JSON.
    Simulate {
        /// Path to a testgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of simulated workers registered up front.
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Number of tasks in the generated plan.
        #[arg(long, default_value = "100")]
        tasks: usize,

        /// Seed for the plan, the executor and the weighted draw.
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Overrides `balancer.strategy`.
        #[arg(long)]
        strategy: Option<Strategy>,

        /// Share of attempts that fail.
        #[arg(long, default_value = "0.0", value_parser = failure_rate_arg)]
        failure_rate: f64,

        /// Mean simulated task duration, e.g. "100ms".
        #[arg(long, default_value = "100ms", value_parser = duration_arg)]
        mean_duration: Duration,

        /// Give up waiting for the plan after this long.
        #[arg(long, default_value = "10m", value_parser = duration_arg)]
        timeout: Duration,

        /// Let the autoscaler grow and shrink a simulated fleet.
        #[arg(long)]
        autoscale: bool,

        /// Tasks slower than this many seconds on average are listed.
        #[arg(long, default_value = "1.0")]
        slow_threshold: f64,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show {
        /// File to merge over the defaults.
        path: Option<PathBuf>,
    },
    /// Validate a configuration file.
    Check { path: PathBuf },
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration: {s:?}"))
}

fn failure_rate_arg(s: &str) -> Result<f64, String> {
    match s.trim().parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => Ok(rate),
        _ => Err(format!("failure rate must be between 0 and 1: {s:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Command::Simulate {
            config,
            workers,
            tasks,
            seed,
            strategy,
            failure_rate,
            mean_duration,
            timeout,
            autoscale,
            slow_threshold,
        } => {
            let mut grid_config = load_config(config.as_deref())?;
            if let Some(strategy) = strategy {
                grid_config.balancer.strategy = strategy.to_string();
            }
            grid_config.balancer.rng_seed = Some(seed);

            let executor = SimulatedExecutor::new(seed)
                .with_mean_duration(mean_duration)
                .with_failure_rate(failure_rate);
            let sim = Simulation {
                workers,
                tasks,
                seed,
                timeout,
                autoscale,
                slow_threshold,
            };
            run_simulation(grid_config, executor, sim).await
        }
        Command::Config { action } => match action {
            ConfigAction::Show { path } => {
                let config = load_config(path.as_deref())?;
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Check { path } => {
                GridConfig::from_file(&path)?;
                println!("{}: ok", path.display());
                Ok(())
            }
        },
    }
}

fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,testgrid=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the JSON report.
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("initializing logging")
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => GridConfig::from_file(path),
        None => Ok(GridConfig::default()),
    }
}

struct Simulation {
    workers: usize,
    tasks: usize,
    seed: u64,
    timeout: Duration,
    autoscale: bool,
    slow_threshold: f64,
}

async fn run_simulation(
    config: GridConfig,
    executor: SimulatedExecutor,
    sim: Simulation,
) -> anyhow::Result<()> {
    info!(
        workers = sim.workers,
        tasks = sim.tasks,
        seed = sim.seed,
        strategy = %config.balancer.initial_strategy(),
        "simulation starting"
    );

    let registry = WorkerRegistry::new(config.registry.clone());
    let heartbeats = spawn_heartbeats(registry.clone(), config.registry.heartbeat_interval / 2);
    let fleet: Option<Arc<dyn FleetProvider>> = sim
        .autoscale
        .then(|| Arc::new(SimulatedFleet::new(registry.clone(), fleet_capabilities())) as Arc<dyn FleetProvider>);
    let grid = Coordinator::with_registry(registry, config, Arc::new(executor), fleet);

    for worker in sim_workers(sim.workers) {
        grid.register_worker(worker).await;
    }
    grid.submit_all(generate_plan(sim.tasks, sim.seed)).await?;
    grid.start().await;

    let drained = tokio::select! {
        drained = grid.wait_for_quiescence(sim.timeout) => drained,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            false
        }
    };
    grid.stop().await;
    heartbeats.abort();

    let results = grid.results();
    let report = serde_json::json!({
        "summary": results.overall_summary().await,
        "workers": results.per_worker_performance().await,
        "failed": results.failed_tasks().await,
        "slow": results.slow_tasks(sim.slow_threshold).await,
        "metrics": grid.metrics_snapshot().await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !drained {
        let counts = grid.scheduler().counts().await;
        warn!(pending = counts.pending, running = counts.running, "simulation did not finish");
        bail!("{} tasks still pending or running", counts.pending + counts.running);
    }
    info!("simulation finished");
    Ok(())
}
