use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Error;
use crate::pipeline::{SyncReport, UpdateOutcome};
use crate::storage::Database;

/// Scan date and repetition index parsed from an archive name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveName {
    pub scan_date: NaiveDate,
    pub num: i64,
}

fn archive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<subject>[A-Za-z0-9]+)_MR_(?P<year>\d{4})_(?P<month>\d{2})_(?P<day>\d{2})_(?P<num>\d+)\.zip$")
            .expect("archive name pattern is valid")
    })
}

/// Parse `{subject}_MR_{YYYY}_{MM}_{DD}_{num}.zip`. Returns `None` when
/// the name does not follow the convention, belongs to another subject,
/// or carries an impossible date.
pub fn parse_archive_name(subject_id: &str, filename: &str) -> Option<ArchiveName> {
    let caps = archive_regex().captures(filename)?;
    if &caps["subject"] != subject_id {
        return None;
    }
    let scan_date = NaiveDate::from_ymd_opt(
        caps["year"].parse().ok()?,
        caps["month"].parse().ok()?,
        caps["day"].parse().ok()?,
    )?;
    let num = caps["num"].parse().ok()?;
    Some(ArchiveName { scan_date, num })
}

/// `*.zip` files directly inside `dir`, keyed by file name, with their
/// modification time in seconds.
fn list_archives(dir: &Path) -> HashMap<String, i64> {
    let mut archives = HashMap::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Error reading {}: {}", dir.display(), err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.to_ascii_lowercase().ends_with(".zip") {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        archives.insert(name, modified);
    }
    archives
}

/// Track every archive in each subject's source directory.
///
/// New files get a row (flagged `wrong_format` when the name is off);
/// rows whose file is gone are deleted, or flagged `removed` when a
/// session was already built from them.
pub fn sync_archives(db: &Database) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();

    for subject in db.list_subjects()? {
        let source_dir = Path::new(&subject.source_dir);
        let on_disk = if source_dir.is_dir() {
            list_archives(source_dir)
        } else {
            debug!("{}: no source directory at {}", subject.id, source_dir.display());
            HashMap::new()
        };
        let tracked = db.list_mri_zips(&subject.id)?;

        for zip in &tracked {
            match (on_disk.contains_key(&zip.filename), zip.removed) {
                (true, true) => {
                    info!("{}: {} is back", subject.id, zip.filename);
                    db.set_mri_zip_removed(zip.id, false)?;
                    report.record(UpdateOutcome::Updated);
                }
                (true, false) => report.record(UpdateOutcome::Unchanged),
                (false, true) => report.record(UpdateOutcome::Unchanged),
                (false, false) => {
                    if db.mri_zip_has_session(zip.id)? {
                        info!("{}: {} disappeared, marking removed", subject.id, zip.filename);
                        db.set_mri_zip_removed(zip.id, true)?;
                        report.record(UpdateOutcome::Updated);
                    } else {
                        info!("{}: {} disappeared, deleting", subject.id, zip.filename);
                        db.delete_mri_zip(zip.id)?;
                        report.deleted += 1;
                    }
                }
            }
        }

        let mut new_files: Vec<(&String, &i64)> = on_disk
            .iter()
            .filter(|(name, _)| !tracked.iter().any(|zip| &zip.filename == *name))
            .collect();
        new_files.sort();

        for (filename, modified_at) in new_files {
            let wrong_format = parse_archive_name(&subject.id, filename).is_none();
            if wrong_format {
                warn!("{}: {} does not follow the archive naming convention", subject.id, filename);
            }
            db.insert_mri_zip(&subject.id, filename, *modified_at, wrong_format)?;
            report.record(UpdateOutcome::Inserted);
        }
    }

    Ok(report)
}
