//! Queries shared by every stage tracker table.
//!
//! All tracker tables have the same tracking columns, so each query is
//! written once and formatted with `Stage::table()`.

use super::models::*;
use super::queries::{dwi_context_from_row, DWI_CONTEXT_COLUMNS, DWI_CONTEXT_JOINS};
use super::sqlite::Database;
use crate::pipeline::Stage;
use rusqlite::{params, OptionalExtension, Result, Row};
use std::path::PathBuf;
use tracing::debug;

const TRACKER_COLUMNS: &str = "id, parent_id, filename, processed, running, claimed_at, \
     claim_owner, exit_code, stderr_tail, attempted_at";

fn tracker_from_row(row: &Row<'_>) -> Result<TrackerRow> {
    Ok(TrackerRow {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        filename: row.get(2)?,
        processed: row.get(3)?,
        running: row.get(4)?,
        claimed_at: row.get(5)?,
        claim_owner: row.get(6)?,
        exit_code: row.get(7)?,
        stderr_tail: row.get(8)?,
        attempted_at: row.get(9)?,
    })
}

/// FROM/JOIN clause that reaches `dwi` from a stage's parent row, aliased `p`.
fn parent_joins(stage: Stage) -> String {
    let from = match stage {
        Stage::Topup => "FROM dwi",
        Stage::Eddy => "FROM dwi_topup p JOIN dwi ON dwi.id = p.parent_id",
        Stage::CnnMasking | Stage::Freewater => {
            "FROM dwi_eddy p \
             JOIN dwi_topup t ON t.id = p.parent_id \
             JOIN dwi ON dwi.id = t.parent_id"
        }
        Stage::Skeletonization => {
            "FROM dwi_freewater p \
             JOIN dwi_eddy e ON e.id = p.parent_id \
             JOIN dwi_topup t ON t.id = e.parent_id \
             JOIN dwi ON dwi.id = t.parent_id"
        }
        Stage::ApUnring | Stage::ApDenoise => "FROM dwi_ap p JOIN dwi ON dwi.id = p.dwi_id",
        Stage::PaUnring | Stage::PaDenoise => "FROM dwi_pa p JOIN dwi ON dwi.id = p.dwi_id",
    };
    format!("{} {}", from, DWI_CONTEXT_JOINS)
}

impl Database {
    /// Every unit of work a stage should track, with ancestors resolved.
    ///
    /// Per-scan stages cover `to_be_used` scans of full-data sessions;
    /// topup covers full-data sessions; later stages cover every row of
    /// their parent stage.
    pub fn stage_targets(&self, stage: Stage) -> Result<Vec<StageTarget>> {
        match stage.direction() {
            Some(direction) => self.scan_stage_targets(stage, direction),
            None => self.chained_stage_targets(stage),
        }
    }

    fn scan_stage_targets(&self, stage: Stage, direction: Direction) -> Result<Vec<StageTarget>> {
        let sql = format!(
            "SELECT p.id, p.dwi_id, p.run, p.filename, p.to_be_used, {} {} \
             WHERE p.to_be_used = 1 AND dwi.full_data = 1 \
             ORDER BY subject.id, session_date.scan_date, session_num.num, p.run",
            DWI_CONTEXT_COLUMNS,
            parent_joins(stage)
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let targets = stmt
            .query_map([], |row| {
                let scan = DwiScan {
                    id: row.get(0)?,
                    dwi_id: row.get(1)?,
                    direction,
                    run: row.get(2)?,
                    filename: row.get(3)?,
                    to_be_used: row.get(4)?,
                };
                Ok(StageTarget {
                    stage,
                    parent_id: scan.id,
                    dwi: dwi_context_from_row(row, 5)?,
                    scans: vec![scan],
                    mask_id: None,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(targets)
    }

    fn chained_stage_targets(&self, stage: Stage) -> Result<Vec<StageTarget>> {
        let (parent_column, mask_column, filter) = match stage {
            Stage::Topup => ("dwi.id", "NULL", "WHERE dwi.full_data = 1"),
            Stage::Freewater => (
                "p.id",
                "(SELECT m.id FROM dwi_cnn_masking m WHERE m.parent_id = p.id)",
                "",
            ),
            _ => ("p.id", "NULL", ""),
        };
        let sql = format!(
            "SELECT {}, {}, {} {} {} \
             ORDER BY subject.id, session_date.scan_date, session_num.num",
            parent_column,
            mask_column,
            DWI_CONTEXT_COLUMNS,
            parent_joins(stage),
            filter
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let mut targets = stmt
            .query_map([], |row| {
                Ok(StageTarget {
                    stage,
                    parent_id: row.get(0)?,
                    mask_id: row.get(1)?,
                    dwi: dwi_context_from_row(row, 2)?,
                    scans: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        if stage == Stage::Topup {
            for target in &mut targets {
                target.scans = self.list_usable_scans(target.dwi.dwi_id)?;
            }
        }
        Ok(targets)
    }

    // ── Tracker rows ─────────────────────────────────────────────

    pub fn tracker_row(&self, stage: Stage, parent_id: i64) -> Result<Option<TrackerRow>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE parent_id = ?1",
            TRACKER_COLUMNS,
            stage.table()
        );
        self.connection()
            .query_row(&sql, params![parent_id], tracker_from_row)
            .optional()
    }

    pub fn get_tracker_row(&self, stage: Stage, tracker_id: i64) -> Result<TrackerRow> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            TRACKER_COLUMNS,
            stage.table()
        );
        self.connection()
            .query_row(&sql, params![tracker_id], tracker_from_row)
    }

    pub fn list_tracker_rows(&self, stage: Stage) -> Result<Vec<TrackerRow>> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id",
            TRACKER_COLUMNS,
            stage.table()
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map([], tracker_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every tracker row of `stage` with the output directory of its session,
    /// including rows whose parent is no longer a stage target.
    pub fn list_tracker_outputs(&self, stage: Stage) -> Result<Vec<(TrackerRow, PathBuf)>> {
        let columns = TRACKER_COLUMNS
            .split(',')
            .map(|column| format!("r.{}", column.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let parent = if stage == Stage::Topup { "dwi.id" } else { "p.id" };
        let sql = format!(
            "SELECT {}, dwi.output_dir {} JOIN {} r ON r.parent_id = {} ORDER BY r.id",
            columns,
            parent_joins(stage),
            stage.table(),
            parent
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let output_dir: String = row.get(10)?;
                Ok((tracker_from_row(row)?, PathBuf::from(output_dir)))
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_tracker_row(
        &self,
        stage: Stage,
        parent_id: i64,
        filename: &str,
        processed: bool,
    ) -> Result<i64> {
        let sql = format!(
            "INSERT INTO {} (parent_id, filename, processed) VALUES (?1, ?2, ?3)",
            stage.table()
        );
        self.connection()
            .execute(&sql, params![parent_id, filename, processed])?;
        let id = self.connection().last_insert_rowid();
        debug!("Inserted {} row {} (processed = {})", stage, id, processed);
        Ok(id)
    }

    /// Store a fresh probe result. A found output also ends any claim.
    pub fn set_processed(&self, stage: Stage, tracker_id: i64, processed: bool) -> Result<()> {
        let sql = if processed {
            format!(
                "UPDATE {} SET processed = 1, running = 0, claimed_at = NULL, \
                 claim_owner = NULL WHERE id = ?1",
                stage.table()
            )
        } else {
            format!("UPDATE {} SET processed = 0 WHERE id = ?1", stage.table())
        };
        self.connection().execute(&sql, params![tracker_id])?;
        Ok(())
    }

    pub fn is_processed(&self, stage: Stage, tracker_id: i64) -> Result<bool> {
        let sql = format!("SELECT processed FROM {} WHERE id = ?1", stage.table());
        let processed: Option<bool> = self
            .connection()
            .query_row(&sql, params![tracker_id], |row| row.get(0))
            .optional()?;
        Ok(processed.unwrap_or(false))
    }

    /// True if the parent row of `stage` at `parent_id` is processed.
    pub fn parent_processed(&self, stage: Stage, parent_id: i64) -> Result<bool> {
        match stage {
            Stage::Eddy => self.is_processed(Stage::Topup, parent_id),
            Stage::CnnMasking | Stage::Freewater => self.is_processed(Stage::Eddy, parent_id),
            Stage::Skeletonization => self.is_processed(Stage::Freewater, parent_id),
            _ => Ok(true),
        }
    }

    /// True when every `to_be_used` scan of the Dwi has a processed row in
    /// each per-scan stage.
    pub fn scan_outputs_processed(&self, dwi_id: i64) -> Result<bool> {
        for stage in Stage::Topup.upstream() {
            let Some(direction) = stage.direction() else {
                continue;
            };
            let sql = format!(
                "SELECT COUNT(*), COALESCE(SUM(t.processed), 0) FROM {} s \
                 LEFT JOIN {} t ON t.parent_id = s.id \
                 WHERE s.dwi_id = ?1 AND s.to_be_used = 1",
                direction.table(),
                stage.table()
            );
            let (scans, processed): (i64, i64) = self
                .connection()
                .query_row(&sql, params![dwi_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            if scans == 0 || processed < scans {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn freewater_mask_id(&self, tracker_id: i64) -> Result<Option<i64>> {
        self.connection().query_row(
            "SELECT mask_id FROM dwi_freewater WHERE id = ?1",
            params![tracker_id],
            |row| row.get(0),
        )
    }

    pub fn set_freewater_mask_id(&self, tracker_id: i64, mask_id: Option<i64>) -> Result<()> {
        self.connection().execute(
            "UPDATE dwi_freewater SET mask_id = ?1 WHERE id = ?2",
            params![mask_id, tracker_id],
        )?;
        Ok(())
    }

    // ── Claims ───────────────────────────────────────────────────

    /// Mark a row as in flight for `owner`. Fails when the row is already
    /// processed or held by a claim younger than `lease_ttl_secs`.
    pub fn try_claim(
        &self,
        stage: Stage,
        tracker_id: i64,
        owner: &str,
        now: i64,
        lease_ttl_secs: u64,
    ) -> Result<bool> {
        let cutoff = now - lease_ttl_secs.min(i64::MAX as u64) as i64;
        let sql = format!(
            "UPDATE {} SET running = 1, claimed_at = ?1, claim_owner = ?2 \
             WHERE id = ?3 AND processed = 0 \
               AND (running = 0 OR claimed_at IS NULL OR claimed_at <= ?4)",
            stage.table()
        );
        let changes = self
            .connection()
            .execute(&sql, params![now, owner, tracker_id, cutoff])?;
        Ok(changes > 0)
    }

    /// Release a claim held by `owner` and persist how the command ended.
    pub fn record_outcome(
        &self,
        stage: Stage,
        tracker_id: i64,
        owner: &str,
        exit_code: Option<i32>,
        stderr_tail: Option<&str>,
        attempted_at: &str,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET running = 0, claimed_at = NULL, claim_owner = NULL, \
             exit_code = ?1, stderr_tail = ?2, attempted_at = ?3 \
             WHERE id = ?4 AND claim_owner = ?5",
            stage.table()
        );
        let changes = self.connection().execute(
            &sql,
            params![exit_code, stderr_tail, attempted_at, tracker_id, owner],
        )?;
        Ok(changes > 0)
    }

    /// Clear claims older than the lease. Returns the number released.
    pub fn release_stale_claims(&self, stage: Stage, now: i64, lease_ttl_secs: u64) -> Result<usize> {
        let cutoff = now - lease_ttl_secs.min(i64::MAX as u64) as i64;
        let sql = format!(
            "UPDATE {} SET running = 0, claimed_at = NULL, claim_owner = NULL \
             WHERE running = 1 AND (claimed_at IS NULL OR claimed_at <= ?1)",
            stage.table()
        );
        self.connection().execute(&sql, params![cutoff])
    }

    pub fn stage_status(&self, stage: Stage) -> Result<StageStatus> {
        let sql = format!(
            "SELECT COUNT(*), \
                    COALESCE(SUM(processed), 0), \
                    COALESCE(SUM(CASE WHEN processed = 0 AND running = 1 THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN processed = 0 AND running = 0 \
                                       AND attempted_at IS NOT NULL \
                                       AND (exit_code IS NULL OR exit_code != 0) \
                                       THEN 1 ELSE 0 END), 0) \
             FROM {}",
            stage.table()
        );
        self.connection().query_row(&sql, [], |row| {
            Ok(StageStatus {
                stage: stage.name().to_string(),
                total: row.get(0)?,
                processed: row.get(1)?,
                running: row.get(2)?,
                failed: row.get(3)?,
            })
        })
    }
}
