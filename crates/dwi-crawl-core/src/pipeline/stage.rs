use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::storage::models::{Direction, DwiContext, StageTarget};

/// A tracked preprocessing step. Each variant owns one tracker table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ApUnring,
    PaUnring,
    ApDenoise,
    PaDenoise,
    Topup,
    Eddy,
    CnnMasking,
    Freewater,
    Skeletonization,
}

impl Stage {
    /// All stages in dependency order.
    pub const ALL: [Stage; 9] = [
        Stage::ApUnring,
        Stage::PaUnring,
        Stage::ApDenoise,
        Stage::PaDenoise,
        Stage::Topup,
        Stage::Eddy,
        Stage::CnnMasking,
        Stage::Freewater,
        Stage::Skeletonization,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::ApUnring => "ap-unring",
            Stage::PaUnring => "pa-unring",
            Stage::ApDenoise => "ap-denoise",
            Stage::PaDenoise => "pa-denoise",
            Stage::Topup => "topup",
            Stage::Eddy => "eddy",
            Stage::CnnMasking => "cnn-masking",
            Stage::Freewater => "freewater",
            Stage::Skeletonization => "skeletonization",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Stage::ApUnring => "dwi_ap_unring",
            Stage::PaUnring => "dwi_pa_unring",
            Stage::ApDenoise => "dwi_ap_denoise",
            Stage::PaDenoise => "dwi_pa_denoise",
            Stage::Topup => "dwi_topup",
            Stage::Eddy => "dwi_eddy",
            Stage::CnnMasking => "dwi_cnn_masking",
            Stage::Freewater => "dwi_freewater",
            Stage::Skeletonization => "dwi_skeletonization",
        }
    }

    /// Scan direction for the per-scan stages.
    pub fn direction(self) -> Option<Direction> {
        match self {
            Stage::ApUnring | Stage::ApDenoise => Some(Direction::Ap),
            Stage::PaUnring | Stage::PaDenoise => Some(Direction::Pa),
            _ => None,
        }
    }

    /// Stages whose rows must be processed before this one may run.
    pub fn upstream(self) -> &'static [Stage] {
        match self {
            Stage::ApUnring | Stage::PaUnring | Stage::ApDenoise | Stage::PaDenoise => &[],
            Stage::Topup => &[
                Stage::ApUnring,
                Stage::PaUnring,
                Stage::ApDenoise,
                Stage::PaDenoise,
            ],
            Stage::Eddy => &[Stage::Topup],
            Stage::CnnMasking => &[Stage::Eddy],
            Stage::Freewater => &[Stage::Eddy, Stage::CnnMasking],
            Stage::Skeletonization => &[Stage::Freewater],
        }
    }

    /// Output file name relative to the Dwi output directory.
    pub fn output_filename(self, target: &StageTarget) -> String {
        let run = target.scans.first().map(|scan| scan.run).unwrap_or(1);
        self.output_filename_for(&target.dwi, run)
    }

    /// Output file name for a given Dwi and scan run. `run` only matters
    /// for the AP stages.
    pub fn output_filename_for(self, dwi: &DwiContext, run: i64) -> String {
        let prefix = dwi.prefix();
        match self {
            Stage::ApUnring => format!("{}_dwi_blip_unring{}.nii.gz", prefix, run),
            Stage::PaUnring => format!("{}_dwi_unring.nii.gz", prefix),
            Stage::ApDenoise => format!("{}_dwi_blip_denoise{}.nii.gz", prefix, run),
            Stage::PaDenoise => format!("{}_dwi_denoise.nii.gz", prefix),
            Stage::Topup => "hifi_b0.nii.gz".to_string(),
            Stage::Eddy => format!("{}_eddy_out.nii.gz", prefix),
            Stage::CnnMasking => "mask_cnn.nii.gz".to_string(),
            Stage::Freewater => format!("fw/{}_FW.nii.gz", prefix),
            Stage::Skeletonization => "tbss/tbss_out/stats/MD_combined_roi_avg.csv".to_string(),
        }
    }

    pub fn output_path(self, target: &StageTarget) -> PathBuf {
        target.dwi.output_dir.join(self.output_filename(target))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::DwiScan;

    fn target(stage: Stage, run: i64) -> StageTarget {
        StageTarget {
            stage,
            parent_id: 1,
            dwi: DwiContext {
                dwi_id: 1,
                subject_id: "AB12345".to_string(),
                scan_date: "2023-01-01".to_string(),
                num: 1,
                rawdata_dir: PathBuf::from("/mri/rawdata/sub-AB12345/ses-202301011"),
                output_dir: PathBuf::from("/mri/derivatives/dwipreproc/sub-AB12345/ses-202301011"),
            },
            scans: vec![DwiScan {
                id: 1,
                dwi_id: 1,
                direction: Direction::Ap,
                run,
                filename: format!("sub-AB12345_ses-202301011_dir-AP_run-{}_dwi.nii.gz", run),
                to_be_used: true,
            }],
            mask_id: None,
        }
    }

    #[test]
    fn test_output_paths_follow_layout() {
        let out = "/mri/derivatives/dwipreproc/sub-AB12345/ses-202301011";
        assert_eq!(
            Stage::ApUnring.output_path(&target(Stage::ApUnring, 2)),
            PathBuf::from(format!("{}/sub-AB12345_dwi_blip_unring2.nii.gz", out))
        );
        assert_eq!(
            Stage::PaUnring.output_path(&target(Stage::PaUnring, 1)),
            PathBuf::from(format!("{}/sub-AB12345_dwi_unring.nii.gz", out))
        );
        assert_eq!(
            Stage::Freewater.output_path(&target(Stage::Freewater, 1)),
            PathBuf::from(format!("{}/fw/sub-AB12345_FW.nii.gz", out))
        );
        assert_eq!(
            Stage::Skeletonization.output_filename(&target(Stage::Skeletonization, 1)),
            "tbss/tbss_out/stats/MD_combined_roi_avg.csv"
        );
    }

    #[test]
    fn test_stage_names_round_trip_through_from_str() {
        for stage in Stage::ALL {
            assert_eq!(stage.name().parse::<Stage>().unwrap(), stage);
        }
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn test_upstream_is_earlier_in_order() {
        for (idx, stage) in Stage::ALL.iter().enumerate() {
            for upstream in stage.upstream() {
                let pos = Stage::ALL.iter().position(|s| s == upstream).unwrap();
                assert!(pos < idx, "{} must come before {}", upstream, stage);
            }
        }
    }
}
