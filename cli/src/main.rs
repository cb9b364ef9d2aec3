//! vaultsim - scenario replay for the epoch vault and DVP ledgers
//!
//! Loads a TOML scenario, drives a market wired to the reference
//! collaborators step by step, and reports every epoch roll.

use anyhow::bail;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod config;
mod report;
mod scenario;

use config::{load_scenario, SAMPLE_SCENARIO};
use scenario::Runner;

#[derive(Parser)]
#[command(name = "vaultsim")]
#[command(about = "Epoch vault simulator - replay scenarios against the vault and DVP ledgers", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output (debug logs from the ledgers)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file
    Run {
        /// Path to the scenario TOML
        scenario: PathBuf,

        /// Also write the full report as JSON
        #[arg(long)]
        json: Option<PathBuf>,

        /// Continue after a failed step
        #[arg(long)]
        keep_going: bool,
    },

    /// Check a scenario file without running it
    Validate {
        /// Path to the scenario TOML
        scenario: PathBuf,
    },

    /// Print a sample scenario
    Sample,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Commands::Run {
            scenario,
            json,
            keep_going,
        } => {
            let scenario = load_scenario(&scenario)?;
            if cli.verbose {
                println!("{} {}", "Scenario:".bright_cyan(), scenario.name);
                if !scenario.description.is_empty() {
                    println!("{} {}", "Description:".bright_cyan(), scenario.description);
                }
                println!("{} {}\n", "Steps:".bright_cyan(), scenario.steps.len());
            }

            let report = Runner::new(&scenario)?.run(&scenario, keep_going)?;
            report::print_report(&report, scenario.market.base_decimals);

            if let Some(path) = json {
                report::write_json(&report, &path)?;
                println!("{} {}", "Report written to".dimmed(), path.display());
            }
            if report.failures > 0 {
                bail!("{} step(s) failed", report.failures);
            }
        }
        Commands::Validate { scenario } => {
            let parsed = load_scenario(&scenario)?;
            println!(
                "{} {} ({} steps)",
                "✓".bright_green(),
                parsed.name,
                parsed.steps.len()
            );
        }
        Commands::Sample => {
            print!("{SAMPLE_SCENARIO}");
        }
    }

    Ok(())
}
