use chrono::NaiveDate;
use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::archives::parse_archive_name;
use crate::config::AppConfig;
use crate::error::Error;
use crate::pipeline::probe::dir_exists;
use crate::pipeline::{SyncReport, UpdateOutcome};
use crate::storage::Database;

/// `ses-{YYYYMMDD}{num}`
pub fn session_label(scan_date: NaiveDate, num: i64) -> String {
    format!("ses-{}{}", scan_date.format("%Y%m%d"), num)
}

/// Source, rawdata and QQC derivative directories of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirs {
    pub source_dir: PathBuf,
    pub rawdata_dir: PathBuf,
    pub derivative_dir: PathBuf,
}

pub fn session_dirs(config: &AppConfig, subject_id: &str, session: &str) -> SessionDirs {
    let subject_dir = format!("sub-{}", subject_id);
    SessionDirs {
        source_dir: config
            .mri_root
            .join("sourcedata")
            .join(subject_id)
            .join(session),
        rawdata_dir: config
            .mri_root
            .join("rawdata")
            .join(&subject_dir)
            .join(session),
        derivative_dir: config
            .derivatives_dir()
            .join("quick_qc")
            .join(&subject_dir)
            .join(session),
    }
}

/// Expand each well-formed archive into SessionDate, SessionNum and Qqc
/// rows. Missing rows are inserted; existing ones are never modified.
pub fn sync_sessions(db: &Database, config: &AppConfig) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();

    for zip in db.list_valid_mri_zips()? {
        let Some(archive) = parse_archive_name(&zip.subject_id, &zip.filename) else {
            warn!("{}: cannot parse {}, skipping", zip.subject_id, zip.filename);
            continue;
        };
        let scan_date = archive.scan_date.format("%Y-%m-%d").to_string();

        let (session_date_id, inserted) =
            db.find_or_create_session_date(&zip.subject_id, &scan_date, zip.id)?;
        report.record(if inserted { UpdateOutcome::Inserted } else { UpdateOutcome::Unchanged });

        let (session_num_id, inserted) = db.find_or_create_session_num(session_date_id, archive.num)?;
        report.record(if inserted { UpdateOutcome::Inserted } else { UpdateOutcome::Unchanged });

        if db.find_qqc_by_session_num(session_num_id)?.is_some() {
            report.record(UpdateOutcome::Unchanged);
            continue;
        }
        let label = session_label(archive.scan_date, archive.num);
        let dirs = session_dirs(config, &zip.subject_id, &label);
        db.insert_qqc(
            session_num_id,
            &dirs.source_dir.to_string_lossy(),
            &dirs.rawdata_dir.to_string_lossy(),
            &dirs.derivative_dir.to_string_lossy(),
        )?;
        debug!("{}: tracking QQC for {}", zip.subject_id, label);
        report.record(UpdateOutcome::Inserted);
    }

    Ok(report)
}

/// True if the subject's source directory holds the run sheet for session `num`.
pub fn run_sheet_exists(subject_source_dir: &Path, num: i64) -> Result<bool, Error> {
    let pattern = format!(
        "{}/*Run_sheet_mri_{}.csv",
        Pattern::escape(&subject_source_dir.to_string_lossy()),
        num
    );
    Ok(glob::glob(&pattern)?.flatten().any(|path| path.is_file()))
}

/// Refresh the QQC flags of every session from the filesystem.
pub fn probe_qqc(db: &Database, config: &AppConfig) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();

    for context in db.list_qqc_contexts()? {
        let qqc = &context.qqc;
        let derivative_dir = Path::new(&qqc.derivative_dir);
        let executed = dir_exists(derivative_dir);
        let completed = derivative_dir.join(&config.qqc_summary_file).is_file();
        let run_sheet = run_sheet_exists(Path::new(&context.subject_source_dir), context.num)?;

        if (executed, completed, run_sheet)
            == (qqc.qqc_executed, qqc.qqc_completed, qqc.run_sheet_exists)
        {
            report.record(UpdateOutcome::Unchanged);
            continue;
        }
        db.update_qqc_flags(qqc.id, executed, completed, run_sheet)?;
        report.record(UpdateOutcome::Updated);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_session_dirs_layout() {
        let config = AppConfig::with_roots("/mri", "/phoenix");
        let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let label = session_label(date, 1);
        assert_eq!(label, "ses-202301011");

        let dirs = session_dirs(&config, "AB12345", &label);
        assert_eq!(dirs.source_dir, PathBuf::from("/mri/sourcedata/AB12345/ses-202301011"));
        assert_eq!(dirs.rawdata_dir, PathBuf::from("/mri/rawdata/sub-AB12345/ses-202301011"));
        assert_eq!(
            dirs.derivative_dir,
            PathBuf::from("/mri/derivatives/quick_qc/sub-AB12345/ses-202301011")
        );
    }

    #[test]
    fn test_run_sheet_matches_session_number() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("AB12345.AB.Run_sheet_mri_1.csv"), "field,value\n").unwrap();

        assert!(run_sheet_exists(tmp.path(), 1).unwrap());
        assert!(!run_sheet_exists(tmp.path(), 2).unwrap());
    }
}
