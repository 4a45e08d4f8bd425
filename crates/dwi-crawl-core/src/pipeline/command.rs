use std::path::{Path, PathBuf};

use super::Stage;
use crate::config::ToolPaths;
use crate::storage::models::{Direction, DwiScan, StageTarget};

/// A fully built shell command for one tracker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedCommand {
    pub stage: Stage,
    pub tracker_id: i64,
    /// `{subject}/ses-{date}{num}`, used in logs and the error caselist.
    pub session: String,
    pub output: PathBuf,
    pub line: String,
}

/// Build the command that produces `target`'s output for `stage`.
///
/// Inputs are taken from the resolved target and never checked for
/// existence; the external tool fails on its own when they are missing.
pub fn materialize(
    stage: Stage,
    target: &StageTarget,
    tracker_id: i64,
    tools: &ToolPaths,
) -> MaterializedCommand {
    let dwi = &target.dwi;
    let out_dir = &dwi.output_dir;
    let output = stage.output_path(target);
    let prefix = dwi.prefix();

    let line = match stage {
        Stage::ApUnring | Stage::PaUnring => {
            let raw = raw_input(target);
            format!("{} {} {}", quote(&tools.unring), quote(&raw), quote(&output))
        }
        Stage::ApDenoise | Stage::PaDenoise => {
            let raw = raw_input(target);
            format!("{} {} {}", quote(&tools.denoise), quote(&raw), quote(&output))
        }
        Stage::Topup => {
            let unringed = scan_outputs(target, Stage::ApUnring, Stage::PaUnring);
            let denoised = scan_outputs(target, Stage::ApDenoise, Stage::PaDenoise);
            format!(
                "{} --outdir {} --prefix {} --unring {} --denoise {}",
                quote(&tools.topup),
                quote(out_dir),
                prefix,
                join_quoted(&unringed),
                join_quoted(&denoised),
            )
        }
        Stage::Eddy => format!(
            "{} --outdir {} --topup {} --out {}",
            quote(&tools.eddy),
            quote(out_dir),
            quote(&out_dir.join("hifi_b0.nii.gz")),
            quote(&out_dir.join(format!("{}_eddy_out", prefix))),
        ),
        Stage::CnnMasking => format!(
            "{} -i {} -o {}",
            quote(&tools.cnn_masking),
            quote(&eddy_output(target)),
            quote(&output),
        ),
        Stage::Freewater => format!(
            "{} --dwi {} --mask {} --outdir {}",
            quote(&tools.freewater),
            quote(&eddy_output(target)),
            quote(&out_dir.join(Stage::CnnMasking.output_filename(target))),
            quote(&out_dir.join("fw")),
        ),
        Stage::Skeletonization => format!(
            "{} --input {} --modality FW --outdir {}",
            quote(&tools.tbss),
            quote(&out_dir.join(Stage::Freewater.output_filename(target))),
            quote(&out_dir.join("tbss")),
        ),
    };

    MaterializedCommand {
        stage,
        tracker_id,
        session: format!("{}/{}", dwi.subject_id, dwi.session_label()),
        output,
        line,
    }
}

fn raw_input(target: &StageTarget) -> PathBuf {
    match target.scans.first() {
        Some(scan) => target.dwi.raw_scan_path(scan),
        None => target.dwi.rawdata_dir.join("dwi"),
    }
}

fn eddy_output(target: &StageTarget) -> PathBuf {
    target
        .dwi
        .output_dir
        .join(Stage::Eddy.output_filename(target))
}

/// Per-scan outputs of the AP/PA stage pair, AP runs first.
fn scan_outputs(target: &StageTarget, ap: Stage, pa: Stage) -> Vec<PathBuf> {
    let mut scans: Vec<&DwiScan> = target.scans.iter().collect();
    scans.sort_by_key(|scan| (scan.direction == Direction::Pa, scan.run));
    scans
        .into_iter()
        .map(|scan| {
            let stage = match scan.direction {
                Direction::Ap => ap,
                Direction::Pa => pa,
            };
            target
                .dwi
                .output_dir
                .join(stage.output_filename_for(&target.dwi, scan.run))
        })
        .collect()
}

fn join_quoted(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| quote(path))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-quote a path for `sh -c` unless it is made of safe characters.
fn quote(path: &Path) -> String {
    let text = path.to_string_lossy();
    let safe = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c));
    if safe {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}
