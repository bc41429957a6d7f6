//! Scheduled mode: an initial run, then one run per configured interval.

use anyhow::{Context, Result};
use clap::Args;
use haulsync::coordinator::parse_entities;
use haulsync::{EngineConfig, RunCoordinator, SyncScheduler};
use tracing::info;

#[derive(Args)]
pub struct ScheduleArgs {
    /// Entities to sync each cycle; all of them when omitted
    pub entities: Vec<String>
}

pub async fn run(args: ScheduleArgs) -> Result<()> {
    let entities = parse_entities(&args.entities)?;
    let config = EngineConfig::from_env().context("configuration error")?;
    let interval = config.interval();
    info!(minutes = config.interval_minutes, "starting scheduler");

    let coordinator = RunCoordinator::from_config(&config)?;
    let scheduler = SyncScheduler::new(coordinator, interval);
    scheduler.run_until_shutdown(&entities).await?;
    Ok(())
}
