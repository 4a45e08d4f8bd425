mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use dwi_crawl_core::pipeline::StageResult;
use dwi_crawl_core::{AppConfig, CrawlEngine, Stage};
use progress::CliReporter;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match dwi_crawl_core::config::load_configuration(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let Some(command) = args.command else {
        let _ = Cli::command().print_long_help();
        return Ok(());
    };

    let engine = CrawlEngine::new(config);
    let outcome = match command {
        Commands::Sync => run_sync(&engine),
        Commands::Discover => run_discover(&engine),
        Commands::Reconcile { stage } => run_reconcile(&engine, stage),
        Commands::Run { stage } => run_stage(&engine, stage),
        Commands::RunAll => run_all(&engine),
        Commands::Status { json } => run_status(&engine, json),
        Commands::ReleaseStale => engine
            .release_stale()
            .map(|released| info!("{} stale claims released", released))
            .context("releasing stale claims"),
        Commands::PrintConfig => {
            println!("Configuration: {:#?}", engine.config());
            Ok(())
        }
        Commands::TruncateDb => {
            confirm_then(
                "Are you SURE you want to delete every row in the database?",
                || engine.truncate_database().context("truncating database"),
            )
        }
        Commands::DropDb => {
            confirm_then(
                "Are you SURE you want to DROP and recreate every table?",
                || engine.drop_database().context("dropping database"),
            )
        }
    };

    if let Err(err) = outcome {
        error!("Error: {:#}", err);
        process::exit(1);
    }
    Ok(())
}

fn run_sync(engine: &CrawlEngine) -> Result<()> {
    let reporter = CliReporter::new();
    let summary = engine.sync_sources(&reporter)?;
    let total = summary.total();
    info!(
        "Sync finished in {}: {} inserted, {} updated, {} deleted",
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
        format!("{}", total.inserted).green(),
        format!("{}", total.updated).yellow(),
        format!("{}", total.deleted).red(),
    );
    Ok(())
}

fn run_discover(engine: &CrawlEngine) -> Result<()> {
    let reporter = CliReporter::new();
    let report = engine.discover(&reporter)?;
    info!(
        "Discovery: {} inserted, {} updated",
        format!("{}", report.inserted).green(),
        format!("{}", report.updated).yellow(),
    );
    Ok(())
}

fn run_reconcile(engine: &CrawlEngine, stage: Stage) -> Result<()> {
    let plan = engine.plan(stage)?;
    for command in &plan.commands {
        println!("{}", command.line);
    }
    info!(
        "[{}] {} to run, {} processed, {} not ready, {} in flight",
        stage,
        format!("{}", plan.commands.len()).cyan(),
        format!("{}", plan.processed).green(),
        format!("{}", plan.not_ready).yellow(),
        format!("{}", plan.in_flight).yellow(),
    );
    Ok(())
}

fn run_stage(engine: &CrawlEngine, stage: Stage) -> Result<()> {
    let reporter = CliReporter::new();
    let result = engine
        .run_stage(stage, &reporter)
        .with_context(|| format!("running {}", stage))?;
    print_result(&result, engine.config());
    Ok(())
}

fn run_all(engine: &CrawlEngine) -> Result<()> {
    let reporter = CliReporter::new();
    for result in engine.run_all(&reporter)? {
        print_result(&result, engine.config());
    }
    Ok(())
}

fn print_result(result: &StageResult, config: &AppConfig) {
    info!(
        "[{}] {} submitted, {} succeeded, {} failed, {} newly processed",
        result.stage,
        format!("{}", result.submitted).cyan(),
        format!("{}", result.succeeded).green(),
        format!("{}", result.failed).red(),
        format!("{}", result.newly_processed).green(),
    );
    if result.lost_claims > 0 {
        warn!(
            "[{}] {} rows were taken by another run",
            result.stage, result.lost_claims
        );
    }
    if result.failed > 0 && config.error_caselist.exists() {
        warn!(
            "[{}] see {} for submission failures",
            result.stage,
            config.error_caselist.display()
        );
    }
}

fn run_status(engine: &CrawlEngine, json: bool) -> Result<()> {
    let status = engine.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "{:<16} {:>7} {:>9} {:>8} {:>7} {:>8}",
        "stage", "total", "processed", "running", "failed", "pending"
    );
    for row in &status {
        println!(
            "{:<16} {:>7} {:>9} {:>8} {:>7} {:>8}",
            row.stage,
            row.total,
            row.processed.to_string().green(),
            row.running.to_string().cyan(),
            row.failed.to_string().red(),
            row.pending(),
        );
    }
    Ok(())
}

fn confirm_then<F>(prompt: &str, action: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    if prompt_confirm(prompt, Some(false))? {
        action()?;
        println!("Done");
    }
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
