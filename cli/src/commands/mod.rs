pub mod schedule;
pub mod sync;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "haulsync", version, about = "Airtable/Supabase reconciliation for the haul dispatch base")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one reconciliation pass and exit
    Sync(sync::SyncArgs),
    /// Run on a fixed interval until interrupted
    Schedule(schedule::ScheduleArgs)
}
