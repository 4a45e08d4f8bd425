use glob::Pattern;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::Error;
use crate::pipeline::{SyncReport, UpdateOutcome};
use crate::storage::models::{Direction, DwiScan, QqcContext};
use crate::storage::Database;

fn scan_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"dir-(?P<dir>AP|PA).*_run-(?P<run>\d+)_dwi\.nii\.gz$")
            .expect("scan pattern is valid")
    })
}

/// Direction and run number encoded in a BIDS diffusion file name.
pub fn parse_scan_name(filename: &str) -> Option<(Direction, i64)> {
    let caps = scan_regex().captures(filename)?;
    let direction = match &caps["dir"] {
        "AP" => Direction::Ap,
        _ => Direction::Pa,
    };
    let run = caps["run"].parse().ok()?;
    Some((direction, run))
}

/// Output directory of the diffusion pipeline for one session.
pub fn dwi_output_dir(config: &AppConfig, context: &QqcContext) -> PathBuf {
    config
        .derivatives_dir()
        .join(&config.dwipreproc_dir)
        .join(format!("sub-{}", context.subject_id))
        .join(format!(
            "ses-{}{}",
            context.scan_date.replace('-', ""),
            context.num
        ))
}

fn list_scan_files(dwi_dir: &Path, direction: Direction) -> Result<Vec<String>, Error> {
    let pattern = format!(
        "{}/*dir-{}*_dwi.nii.gz",
        Pattern::escape(&dwi_dir.to_string_lossy()),
        direction.label()
    );
    let mut names: Vec<String> = glob::glob(&pattern)?
        .flatten()
        .filter(|path| path.is_file())
        .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

/// Create Dwi and scan rows for every session with a rawdata `dwi/`
/// directory, then recompute the full-data flags.
pub fn discover_dwi(db: &Database, config: &AppConfig) -> Result<SyncReport, Error> {
    let mut report = SyncReport::default();

    for context in db.list_qqc_contexts()? {
        let dwi_dir = Path::new(&context.qqc.rawdata_dir).join("dwi");
        if !dwi_dir.is_dir() {
            continue;
        }

        let dwi_id = match db.find_dwi_by_qqc(context.qqc.id)? {
            Some(dwi) => {
                report.record(UpdateOutcome::Unchanged);
                dwi.id
            }
            None => {
                let output_dir = dwi_output_dir(config, &context);
                let id = db.insert_dwi(context.qqc.id, &output_dir.to_string_lossy())?;
                debug!("{}: new Dwi at {}", context.subject_id, output_dir.display());
                report.record(UpdateOutcome::Inserted);
                id
            }
        };

        for direction in [Direction::Ap, Direction::Pa] {
            for filename in list_scan_files(&dwi_dir, direction)? {
                let Some((parsed, run)) = parse_scan_name(&filename) else {
                    warn!("{}: unrecognised scan name {}", context.subject_id, filename);
                    continue;
                };
                if parsed != direction {
                    warn!("{}: ambiguous direction in {}", context.subject_id, filename);
                    continue;
                }
                if db.find_scan(dwi_id, direction, run, &filename)?.is_some() {
                    report.record(UpdateOutcome::Unchanged);
                    continue;
                }
                db.insert_scan(dwi_id, direction, run, &filename)?;
                report.record(UpdateOutcome::Inserted);
            }
        }

        match check_full_data(db, dwi_id)? {
            UpdateOutcome::Unchanged => {}
            outcome => report.record(outcome),
        }
    }

    Ok(report)
}

/// `(full, extra)` for one direction: full means exactly the expected
/// number of files with no run number repeated.
fn run_coverage(scans: &[DwiScan], direction: Direction) -> (bool, bool) {
    let runs: HashSet<i64> = scans.iter().map(|scan| scan.run).collect();
    let expected = direction.expected_runs();
    let duplicated = runs.len() < scans.len();
    (
        scans.len() == expected && !duplicated,
        scans.len() > expected || duplicated,
    )
}

/// Recompute `full_data`, `extra_data` and each scan's `to_be_used`.
///
/// A session is complete with exactly two distinct AP runs and one PA run; only
/// then are its scans marked for use. Writes happen only on change.
pub fn check_full_data(db: &Database, dwi_id: i64) -> Result<UpdateOutcome, Error> {
    let ap = db.list_scans(dwi_id, Direction::Ap)?;
    let pa = db.list_scans(dwi_id, Direction::Pa)?;

    let (ap_full, ap_extra) = run_coverage(&ap, Direction::Ap);
    let (pa_full, pa_extra) = run_coverage(&pa, Direction::Pa);
    let full_data = ap_full && pa_full;
    let extra_data = ap_extra || pa_extra;

    let mut outcome = UpdateOutcome::Unchanged;
    let dwi = db.get_dwi(dwi_id)?;
    if (dwi.full_data, dwi.extra_data) != (full_data, extra_data) {
        info!(
            "Dwi {}: {} AP / {} PA, full_data={} extra_data={}",
            dwi_id,
            ap.len(),
            pa.len(),
            full_data,
            extra_data
        );
        db.set_dwi_flags(dwi_id, full_data, extra_data)?;
        outcome = UpdateOutcome::Updated;
    }

    for scan in ap.iter().chain(pa.iter()) {
        if scan.to_be_used != full_data {
            db.set_scan_to_be_used(scan.direction, scan.id, full_data)?;
            outcome = UpdateOutcome::Updated;
        }
    }

    Ok(outcome)
}
