use serde::Serialize;
use std::path::PathBuf;

use crate::pipeline::Stage;

/// A study participant, keyed by study ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub site: String,
    pub network: String,
    pub source_dir: String,
}

/// A raw-data archive discovered in a subject's source directory.
#[derive(Debug, Clone)]
pub struct MriZip {
    pub id: i64,
    pub subject_id: String,
    pub filename: String,
    pub modified_at: i64,
    pub wrong_format: bool,
    pub removed: bool,
}

/// Quality-control record for one session.
#[derive(Debug, Clone)]
pub struct Qqc {
    pub id: i64,
    pub session_num_id: i64,
    pub source_dir: String,
    pub rawdata_dir: String,
    pub derivative_dir: String,
    pub qqc_executed: bool,
    pub qqc_completed: bool,
    pub run_sheet_exists: bool,
}

/// A Qqc row together with the subject and session it belongs to.
#[derive(Debug, Clone)]
pub struct QqcContext {
    pub qqc: Qqc,
    pub subject_id: String,
    pub subject_source_dir: String,
    pub scan_date: String,
    pub num: i64,
}

#[derive(Debug, Clone)]
pub struct Dwi {
    pub id: i64,
    pub qqc_id: i64,
    pub output_dir: String,
    pub full_data: bool,
    pub extra_data: bool,
}

/// Phase-encoding direction of a diffusion scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Ap,
    Pa,
}

impl Direction {
    pub fn table(self) -> &'static str {
        match self {
            Direction::Ap => "dwi_ap",
            Direction::Pa => "dwi_pa",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Ap => "AP",
            Direction::Pa => "PA",
        }
    }

    /// Number of runs the acquisition protocol calls for.
    pub fn expected_runs(self) -> usize {
        match self {
            Direction::Ap => 2,
            Direction::Pa => 1,
        }
    }
}

/// One phase-encoded diffusion scan (a `dwi_ap` or `dwi_pa` row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwiScan {
    pub id: i64,
    pub dwi_id: i64,
    pub direction: Direction,
    pub run: i64,
    pub filename: String,
    pub to_be_used: bool,
}

/// A Dwi with every ancestor needed to build paths resolved up front.
#[derive(Debug, Clone)]
pub struct DwiContext {
    pub dwi_id: i64,
    pub subject_id: String,
    pub scan_date: String,
    pub num: i64,
    pub rawdata_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl DwiContext {
    /// `ses-{YYYYMMDD}{num}`
    pub fn session_label(&self) -> String {
        format!("ses-{}{}", self.scan_date.replace('-', ""), self.num)
    }

    /// `sub-{subject}`, the prefix of every derived file name.
    pub fn prefix(&self) -> String {
        format!("sub-{}", self.subject_id)
    }

    pub fn raw_scan_path(&self, scan: &DwiScan) -> PathBuf {
        self.rawdata_dir.join("dwi").join(&scan.filename)
    }
}

/// A unit of work for one stage: the parent row a tracker row hangs off,
/// plus everything the probe and the command templates need.
#[derive(Debug, Clone)]
pub struct StageTarget {
    pub stage: Stage,
    pub parent_id: i64,
    pub dwi: DwiContext,
    /// The scan for per-scan stages; every `to_be_used` scan for topup.
    pub scans: Vec<DwiScan>,
    /// CNN mask row referenced by a freewater target.
    pub mask_id: Option<i64>,
}

/// Persisted state of one tracker row.
#[derive(Debug, Clone)]
pub struct TrackerRow {
    pub id: i64,
    pub parent_id: i64,
    pub filename: String,
    pub processed: bool,
    pub running: bool,
    pub claimed_at: Option<i64>,
    pub claim_owner: Option<String>,
    pub exit_code: Option<i64>,
    pub stderr_tail: Option<String>,
    pub attempted_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    NotProcessed,
    Processing,
    Failed,
    Processed,
}

impl TrackerRow {
    pub fn state(&self) -> StageState {
        if self.processed {
            StageState::Processed
        } else if self.running {
            StageState::Processing
        } else if self.attempted_at.is_some() && self.exit_code != Some(0) {
            // no exit code means the command never started or was killed
            StageState::Failed
        } else {
            StageState::NotProcessed
        }
    }
}

/// Per-stage counts for the status report.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub total: i64,
    pub processed: i64,
    pub running: i64,
    pub failed: i64,
}

impl StageStatus {
    pub fn pending(&self) -> i64 {
        self.total - self.processed - self.running - self.failed
    }
}
