//! One-shot sync command.
//!
//! Per-record failures are reported in the run summary and do not change
//! the exit code; only startup and configuration errors exit nonzero.

use anyhow::{Context, Result};
use clap::Args;
use haulsync::coordinator::parse_entities;
use haulsync::scheduler::spawn_sigint_listener;
use haulsync::{EngineConfig, RunCoordinator, RunType};

#[derive(Args)]
pub struct SyncArgs {
    /// Entities to sync (cars, locations, companies, users, loads,
    /// bookings, requests); all of them in dependency order when omitted
    pub entities: Vec<String>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool
}

pub async fn run(args: SyncArgs) -> Result<()> {
    let entities = parse_entities(&args.entities)?;
    let config = EngineConfig::from_env().context("configuration error")?;
    let coordinator = RunCoordinator::from_config(&config)?;
    spawn_sigint_listener(coordinator.shutdown_handle(), None);

    let report = coordinator.run(&entities, RunType::Manual).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
