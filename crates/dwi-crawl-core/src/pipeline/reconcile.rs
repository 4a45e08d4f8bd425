use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::command::{materialize, MaterializedCommand};
use super::probe::{output_exists, probe};
use super::runner::{self, CommandOutcome};
use super::Stage;
use crate::config::AppConfig;
use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::storage::models::{StageTarget, TrackerRow};
use crate::storage::Database;

/// What a state update did to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Row counts for one discovery or probe pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl SyncReport {
    pub fn record(&mut self, outcome: UpdateOutcome) {
        match outcome {
            UpdateOutcome::Inserted => self.inserted += 1,
            UpdateOutcome::Updated => self.updated += 1,
            UpdateOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Number of writes the pass made.
    pub fn changes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn merge(&mut self, other: &SyncReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }
}

/// Commands a stage would submit, after syncing its tracker rows.
#[derive(Debug, Default)]
pub struct StagePlan {
    pub sync: SyncReport,
    pub commands: Vec<MaterializedCommand>,
    pub processed: usize,
    pub not_ready: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct StageResult {
    pub stage: Stage,
    pub sync: SyncReport,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub newly_processed: usize,
    pub not_ready: usize,
    pub in_flight: usize,
    /// Rows another run claimed between planning and submission.
    pub lost_claims: usize,
}

/// Store the probe result for `target`'s tracker row.
///
/// Inserts the row when missing, writes only when the stored value
/// differs, and otherwise leaves the database untouched.
pub fn update_state(
    db: &Database,
    target: &StageTarget,
    processed: bool,
) -> Result<(TrackerRow, UpdateOutcome), Error> {
    let stage = target.stage;

    let Some(row) = db.tracker_row(stage, target.parent_id)? else {
        let filename = stage.output_filename(target);
        let id = db.insert_tracker_row(stage, target.parent_id, &filename, processed)?;
        if stage == Stage::Freewater && target.mask_id.is_some() {
            db.set_freewater_mask_id(id, target.mask_id)?;
        }
        return Ok((db.get_tracker_row(stage, id)?, UpdateOutcome::Inserted));
    };

    let mut outcome = UpdateOutcome::Unchanged;
    if row.processed != processed {
        info!(
            "[{}] {} {}: processed {} -> {}",
            stage,
            target.dwi.subject_id,
            target.dwi.session_label(),
            row.processed,
            processed
        );
        db.set_processed(stage, row.id, processed)?;
        outcome = UpdateOutcome::Updated;
    }
    if stage == Stage::Freewater && db.freewater_mask_id(row.id)? != target.mask_id {
        db.set_freewater_mask_id(row.id, target.mask_id)?;
        outcome = UpdateOutcome::Updated;
    }

    match outcome {
        UpdateOutcome::Unchanged => Ok((row, outcome)),
        _ => Ok((db.get_tracker_row(stage, row.id)?, outcome)),
    }
}

/// Probe every target of `stage` and bring its tracker rows up to date.
pub fn sync_stage(
    db: &Database,
    stage: Stage,
) -> Result<(SyncReport, Vec<(StageTarget, TrackerRow)>), Error> {
    let targets = db.stage_targets(stage)?;
    let mut report = SyncReport::default();
    let mut rows = Vec::with_capacity(targets.len());

    let mut tracked = HashSet::with_capacity(targets.len());
    for target in targets {
        let processed = probe(stage, &target);
        let (row, outcome) = update_state(db, &target, processed)?;
        report.record(outcome);
        tracked.insert(target.parent_id);
        rows.push((target, row));
    }

    // rows whose parent dropped out of the target set keep following their output
    for (row, output_dir) in db.list_tracker_outputs(stage)? {
        if tracked.contains(&row.parent_id) {
            continue;
        }
        let processed = output_exists(output_dir.join(&row.filename));
        if row.processed == processed {
            report.record(UpdateOutcome::Unchanged);
            continue;
        }
        info!(
            "[{}] untargeted row {}: processed {} -> {}",
            stage, row.id, row.processed, processed
        );
        db.set_processed(stage, row.id, processed)?;
        report.record(UpdateOutcome::Updated);
    }

    debug!(
        "[{}] sync: {} inserted, {} updated, {} unchanged",
        stage, report.inserted, report.updated, report.unchanged
    );
    Ok((report, rows))
}

/// True when every upstream row `target` depends on is processed.
pub fn upstream_ready(db: &Database, target: &StageTarget) -> Result<bool, Error> {
    let ready = match target.stage {
        Stage::ApUnring | Stage::PaUnring | Stage::ApDenoise | Stage::PaDenoise => true,
        Stage::Topup => db.scan_outputs_processed(target.dwi.dwi_id)?,
        Stage::Eddy | Stage::CnnMasking | Stage::Skeletonization => {
            db.parent_processed(target.stage, target.parent_id)?
        }
        Stage::Freewater => {
            let eddy_done = db.parent_processed(Stage::Freewater, target.parent_id)?;
            let mask_done = match target.mask_id {
                Some(mask_id) => db.is_processed(Stage::CnnMasking, mask_id)?,
                None => false,
            };
            eddy_done && mask_done
        }
    };
    Ok(ready)
}

fn lease_expired(row: &TrackerRow, now: i64, lease_ttl_secs: u64) -> bool {
    let cutoff = now - lease_ttl_secs.min(i64::MAX as u64) as i64;
    row.claimed_at.map_or(true, |claimed_at| claimed_at <= cutoff)
}

/// Sync `stage` and materialize commands for rows that are upstream-ready,
/// not processed, and not held by a live claim. Nothing is executed.
pub fn plan_stage(
    db: &Database,
    config: &AppConfig,
    stage: Stage,
    now: i64,
) -> Result<StagePlan, Error> {
    let (sync, rows) = sync_stage(db, stage)?;
    let mut plan = StagePlan {
        sync,
        ..StagePlan::default()
    };

    for (target, row) in rows {
        if row.processed {
            plan.processed += 1;
            continue;
        }
        if !upstream_ready(db, &target)? {
            plan.not_ready += 1;
            continue;
        }
        if row.running && !lease_expired(&row, now, config.lease_ttl_secs) {
            plan.in_flight += 1;
            continue;
        }
        plan.commands
            .push(materialize(stage, &target, row.id, &config.tools));
    }

    debug!(
        "[{}] plan: {} to run, {} processed, {} not ready, {} in flight",
        stage,
        plan.commands.len(),
        plan.processed,
        plan.not_ready,
        plan.in_flight
    );
    Ok(plan)
}

/// Reconcile `stage` and run its pending commands on the stage's pool.
///
/// Each row is claimed for `owner` before submission and released with
/// its outcome once the command returns; outputs are probed again right
/// after the pool drains.
pub fn run_stage(
    db: &Database,
    config: &AppConfig,
    stage: Stage,
    owner: &str,
    reporter: &dyn ProgressReporter,
) -> Result<StageResult, Error> {
    let now = Utc::now().timestamp();
    let plan = plan_stage(db, config, stage, now)?;

    let mut claimed = Vec::with_capacity(plan.commands.len());
    let mut lost_claims = 0;
    for command in plan.commands {
        if db.try_claim(stage, command.tracker_id, owner, now, config.lease_ttl_secs)? {
            claimed.push(command);
        } else {
            lost_claims += 1;
        }
    }
    if lost_claims > 0 {
        warn!("[{}] {} rows were claimed by another run", stage, lost_claims);
    }

    reporter.on_stage_start(stage, claimed.len());
    info!(
        "[{}] submitting {} commands ({} workers)",
        stage,
        claimed.len(),
        config.pools.for_stage(stage)
    );

    let outcomes = match runner::run_commands(
        &claimed,
        config.pools.for_stage(stage),
        &config.error_caselist,
        reporter,
    ) {
        Ok(outcomes) => outcomes,
        // the pool could not be built, so nothing ran
        Err(err) => {
            let attempted_at = Utc::now().to_rfc3339();
            let message = err.to_string();
            for command in &claimed {
                db.record_outcome(
                    stage,
                    command.tracker_id,
                    owner,
                    None,
                    Some(message.as_str()),
                    &attempted_at,
                )?;
            }
            return Err(err);
        }
    };

    let outputs: HashMap<i64, &MaterializedCommand> = claimed
        .iter()
        .map(|command| (command.tracker_id, command))
        .collect();

    let mut result = StageResult {
        stage,
        sync: plan.sync,
        submitted: claimed.len(),
        succeeded: 0,
        failed: 0,
        newly_processed: 0,
        not_ready: plan.not_ready,
        in_flight: plan.in_flight,
        lost_claims,
    };

    let attempted_at = Utc::now().to_rfc3339();
    for outcome in &outcomes {
        record(db, stage, owner, outcome, &attempted_at)?;
        if outcome.succeeded() {
            result.succeeded += 1;
        } else {
            result.failed += 1;
        }

        let produced = outputs
            .get(&outcome.tracker_id)
            .is_some_and(|command| command.output.is_file());
        if produced {
            db.set_processed(stage, outcome.tracker_id, true)?;
            result.newly_processed += 1;
        }
    }

    reporter.on_stage_complete(stage, &result);
    Ok(result)
}

fn record(
    db: &Database,
    stage: Stage,
    owner: &str,
    outcome: &CommandOutcome,
    attempted_at: &str,
) -> Result<(), Error> {
    let released = db.record_outcome(
        stage,
        outcome.tracker_id,
        owner,
        outcome.exit_code,
        outcome.stderr_tail.as_deref(),
        attempted_at,
    )?;
    if !released {
        warn!(
            "[{}] {}: claim on row {} was taken over before the command finished",
            stage, outcome.session, outcome.tracker_id
        );
    }
    Ok(())
}
