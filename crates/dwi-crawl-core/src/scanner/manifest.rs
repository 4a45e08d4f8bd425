use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::Error;
use crate::pipeline::{SyncReport, UpdateOutcome};
use crate::storage::models::Subject;
use crate::storage::Database;

/// One row of the subject manifest CSV.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub subject: String,
    pub site: String,
    pub network: String,
}

/// Read the manifest. Rows that fail to parse are logged and skipped.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut entries = Vec::new();
    for (idx, record) in reader.deserialize::<ManifestEntry>().enumerate() {
        match record {
            Ok(entry) if entry.subject.is_empty() => {
                warn!("Manifest row {} has no subject id, skipping", idx + 2);
            }
            Ok(entry) => entries.push(entry),
            Err(err) => warn!("Skipping manifest row {}: {}", idx + 2, err),
        }
    }
    Ok(entries)
}

/// `{source_root}/{network}/{site}/raw/{subject}/mri`
pub fn subject_source_dir(config: &AppConfig, entry: &ManifestEntry) -> PathBuf {
    config
        .source_root
        .join(&entry.network)
        .join(&entry.site)
        .join("raw")
        .join(&entry.subject)
        .join("mri")
}

/// Insert subjects new to the manifest and delete those no longer listed.
/// Existing subjects are left as they are.
pub fn sync_subjects(
    db: &Database,
    config: &AppConfig,
    entries: &[ManifestEntry],
) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();
    let existing: HashSet<String> = db.list_subjects()?.into_iter().map(|s| s.id).collect();
    let mut listed: HashSet<&str> = HashSet::new();

    for entry in entries {
        if !listed.insert(entry.subject.as_str()) {
            warn!("Subject {} listed twice in manifest", entry.subject);
            continue;
        }
        if existing.contains(&entry.subject) {
            report.record(UpdateOutcome::Unchanged);
            continue;
        }
        db.insert_subject(&Subject {
            id: entry.subject.clone(),
            site: entry.site.clone(),
            network: entry.network.clone(),
            source_dir: subject_source_dir(config, entry).to_string_lossy().into_owned(),
        })?;
        report.record(UpdateOutcome::Inserted);
    }

    for subject_id in existing.iter().filter(|id| !listed.contains(id.as_str())) {
        info!("Subject {} is no longer in the manifest, removing", subject_id);
        report.deleted += db.delete_subject(subject_id)?;
    }

    Ok(report)
}
