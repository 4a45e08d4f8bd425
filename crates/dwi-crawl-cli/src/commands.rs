use clap::{Parser, Subcommand};
use dwi_crawl_core::Stage;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dwi-crawl")]
#[command(about = "Track and run diffusion MRI preprocessing stages", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./Config.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync subjects, archives, sessions and QQC flags from disk
    Sync,
    /// Find DWI AP/PA scans and recompute full-data flags
    Discover,
    /// Probe a stage's outputs and print the commands a run would submit
    Reconcile {
        #[arg(value_parser = parse_stage)]
        stage: Stage,
    },
    /// Reconcile a stage and run its pending commands
    Run {
        #[arg(value_parser = parse_stage)]
        stage: Stage,
    },
    /// Sync, discover, then run every stage in order
    RunAll,
    /// Per-stage row counts
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear claims whose lease has expired
    ReleaseStale,
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
    /// Drop and recreate all database tables
    DropDb,
}

fn parse_stage(value: &str) -> Result<Stage, String> {
    value.parse::<Stage>().map_err(|err| {
        let names: Vec<&str> = Stage::ALL.iter().map(|stage| stage.name()).collect();
        format!("{} (expected one of: {})", err, names.join(", "))
    })
}
