mod output;
mod simulate;
mod telemetry;

use anyhow::Context;
use apmtx_core::config::AgentConfig;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::output::{print_config_human, print_simulation_human};
use crate::simulate::SimulateOptions;
use crate::telemetry::init_cli_tracing;

#[derive(Parser, Debug)]
#[command(name = "apmtx")]
#[command(about = "Inspect agent configuration and run simulated transactions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Print the effective agent configuration")]
    Config,
    #[command(about = "Run one transaction whose async completions race its end")]
    Simulate {
        #[arg(long, default_value_t = 4)]
        completions: usize,
        #[arg(long, default_value_t = 10)]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();

    let config = AgentConfig::load().context("failed loading agent configuration")?;
    match cli.command {
        Commands::Config => {
            if cli.json {
                print_json(&config)?;
            } else {
                print_config_human(&config);
            }
        }
        Commands::Simulate {
            completions,
            delay_ms,
        } => {
            let report = simulate::run(
                config,
                SimulateOptions {
                    completions,
                    delay_ms,
                },
            )
            .await?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_simulation_human(&report);
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
