//! Residency CLI
//!
//! Probes whether device pointers captured into offloaded kernels still
//! address their original allocation.
//!
//! Usage:
//!   residency [run] [options]     # Run every capture strategy (default)
//!   residency topology            # Show devices and peer access
//!
//! Exit status: 0 pass, 1 error, 2 pattern mismatch, 3 divergent strategies.

mod cli;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use residency_probe::{run_probe, DeviceRuntime, SimulatedRuntime, Topology};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands, RunArgs};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let runtime = SimulatedRuntime::new(cli.backend.simulated_config());
    let selector = cli.selector.selector();
    info!(runtime = runtime.name(), %selector, "residency starting");

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Topology => {
            let topology = Topology::probe(&runtime, &selector)
                .with_context(|| format!("device discovery on {} runtime failed", runtime.name()))?;
            output::print_topology(&topology, cli.format)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            let config = args.probe_config(selector);
            let report = run_probe(&runtime, &config).context("probe run failed")?;
            output::print_report(&report, cli.format)?;
            Ok(ExitCode::from(report.verdict.exit_code()))
        }
    }
}
