use chrono::Utc;
use std::process;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::Error;
use crate::pipeline::{reconcile, Stage, StagePlan, StageResult, SyncReport};
use crate::progress::ProgressReporter;
use crate::scanner;
use crate::storage::models::StageStatus;
use crate::storage::Database;

pub struct CrawlEngine {
    config: AppConfig,
    db_path: String,
    owner: String,
}

/// Per-phase counts of a sync pass.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub phases: Vec<(&'static str, SyncReport)>,
    pub duration: Duration,
}

impl SyncSummary {
    pub fn total(&self) -> SyncReport {
        let mut total = SyncReport::default();
        for (_, report) in &self.phases {
            total.merge(report);
        }
        total
    }
}

impl CrawlEngine {
    pub fn new(config: AppConfig) -> Self {
        let db_path = config.db_path.clone();
        Self {
            config,
            db_path,
            owner: format!("pid{}-{}", process::id(), Utc::now().timestamp_millis()),
        }
    }

    pub fn with_db_path(mut self, path: &str) -> Self {
        self.db_path = path.to_string();
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Claim owner recorded on rows this engine submits.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn open_database(&self) -> Result<Database, Error> {
        Ok(Database::open(&self.db_path)?)
    }

    /// Bring the entity tables in line with the manifest and filesystem:
    /// 1. Subjects from the manifest CSV
    /// 2. Raw archives per subject
    /// 3. Sessions and QQC rows from well-formed archives
    /// 4. QQC flags
    pub fn sync_sources(&self, reporter: &dyn ProgressReporter) -> Result<SyncSummary, Error> {
        let start = Instant::now();
        let db = self.open_database()?;
        let mut summary = SyncSummary::default();

        let entries = scanner::read_manifest(&self.config.manifest_path)?;
        summary.phases.push(phase(reporter, "subjects", || {
            scanner::sync_subjects(&db, &self.config, &entries)
        })?);
        summary
            .phases
            .push(phase(reporter, "archives", || scanner::sync_archives(&db))?);
        summary.phases.push(phase(reporter, "sessions", || {
            scanner::sync_sessions(&db, &self.config)
        })?);
        summary
            .phases
            .push(phase(reporter, "qqc", || scanner::probe_qqc(&db, &self.config))?);

        summary.duration = start.elapsed();
        info!(
            "Source sync finished in {:.2}s with {} changes",
            summary.duration.as_secs_f64(),
            summary.total().changes()
        );
        Ok(summary)
    }

    /// Create Dwi and scan rows and recompute the full-data flags.
    pub fn discover(&self, reporter: &dyn ProgressReporter) -> Result<SyncReport, Error> {
        let db = self.open_database()?;
        let (_, report) = phase(reporter, "dwi", || scanner::discover_dwi(&db, &self.config))?;
        Ok(report)
    }

    /// Reconcile `stage` and return the commands a run would submit.
    pub fn plan(&self, stage: Stage) -> Result<StagePlan, Error> {
        let db = self.open_database()?;
        reconcile::plan_stage(&db, &self.config, stage, Utc::now().timestamp())
    }

    pub fn run_stage(
        &self,
        stage: Stage,
        reporter: &dyn ProgressReporter,
    ) -> Result<StageResult, Error> {
        let db = self.open_database()?;
        reconcile::run_stage(&db, &self.config, stage, &self.owner, reporter)
    }

    /// Sync, discover, then run every stage in dependency order.
    pub fn run_all(&self, reporter: &dyn ProgressReporter) -> Result<Vec<StageResult>, Error> {
        self.sync_sources(reporter)?;
        self.discover(reporter)?;
        let mut results = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let result = self.run_stage(stage, reporter)?;
            debug!(
                "[{}] {} submitted, {} newly processed",
                stage, result.submitted, result.newly_processed
            );
            results.push(result);
        }
        Ok(results)
    }

    pub fn status(&self) -> Result<Vec<StageStatus>, Error> {
        let db = self.open_database()?;
        Stage::ALL
            .iter()
            .map(|stage| db.stage_status(*stage).map_err(Error::from))
            .collect()
    }

    /// Clear claims whose lease has expired, across every stage.
    pub fn release_stale(&self) -> Result<usize, Error> {
        let db = self.open_database()?;
        let now = Utc::now().timestamp();
        let mut released = 0;
        for stage in Stage::ALL {
            let count = db.release_stale_claims(stage, now, self.config.lease_ttl_secs)?;
            if count > 0 {
                info!("[{}] released {} stale claims", stage, count);
            }
            released += count;
        }
        Ok(released)
    }

    pub fn truncate_database(&self) -> Result<(), Error> {
        Ok(self.open_database()?.truncate_all()?)
    }

    pub fn drop_database(&self) -> Result<(), Error> {
        Ok(self.open_database()?.drop_all()?)
    }
}

fn phase<F>(
    reporter: &dyn ProgressReporter,
    name: &'static str,
    sync: F,
) -> Result<(&'static str, SyncReport), Error>
where
    F: FnOnce() -> Result<SyncReport, Error>,
{
    reporter.on_sync_start(name);
    let report = sync()?;
    debug!(
        "{}: {} inserted, {} updated, {} deleted, {} unchanged",
        name, report.inserted, report.updated, report.deleted, report.unchanged
    );
    reporter.on_sync_complete(name, &report);
    Ok((name, report))
}
