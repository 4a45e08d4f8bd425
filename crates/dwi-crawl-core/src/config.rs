use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::pipeline::Stage;

/// Runtime configuration injected into every component.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Root of the BIDS tree (`rawdata/`, `sourcedata/`, `derivatives/`).
    pub mri_root: PathBuf,
    /// Root of the secure source-data tree holding the raw MRI archives.
    pub source_root: PathBuf,
    /// CSV listing the study subjects (`subject,site,network`).
    pub manifest_path: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_error_caselist")]
    pub error_caselist: PathBuf,
    #[serde(default = "default_dwipreproc_dir")]
    pub dwipreproc_dir: String,
    #[serde(default = "default_qqc_summary_file")]
    pub qqc_summary_file: String,
    /// Age after which a `running` claim may be taken over by another run.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub pools: PoolSizes,
}

/// Absolute paths of the external programs each stage invokes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub unring: PathBuf,
    pub denoise: PathBuf,
    pub topup: PathBuf,
    pub eddy: PathBuf,
    pub cnn_masking: PathBuf,
    pub freewater: PathBuf,
    pub tbss: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            unring: PathBuf::from("/usr/local/bin/unring.a64"),
            denoise: PathBuf::from("/usr/local/mrtrix3/bin/dwidenoise"),
            topup: PathBuf::from("/usr/local/fsl/bin/topup_wrapper.sh"),
            eddy: PathBuf::from("/usr/local/fsl/bin/eddy_wrapper.sh"),
            cnn_masking: PathBuf::from("/opt/CNN-Diffusion-MRIBrain-Segmentation/pipeline/dwi_masking.py"),
            freewater: PathBuf::from("/opt/pnlpipe/freewater_wrapper.sh"),
            tbss: PathBuf::from("/opt/TBSS/lib/tbss_all"),
        }
    }
}

/// Worker count of the fan-out pool, per stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSizes {
    pub unring: usize,
    pub denoise: usize,
    pub topup: usize,
    pub eddy: usize,
    pub cnn_masking: usize,
    pub freewater: usize,
    pub skeletonization: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            unring: 10,
            denoise: 10,
            topup: 4,
            eddy: 2,
            cnn_masking: 2,
            freewater: 4,
            skeletonization: 4,
        }
    }
}

impl PoolSizes {
    pub fn for_stage(&self, stage: Stage) -> usize {
        let size = match stage {
            Stage::ApUnring | Stage::PaUnring => self.unring,
            Stage::ApDenoise | Stage::PaDenoise => self.denoise,
            Stage::Topup => self.topup,
            Stage::Eddy => self.eddy,
            Stage::CnnMasking => self.cnn_masking,
            Stage::Freewater => self.freewater,
            Stage::Skeletonization => self.skeletonization,
        };
        size.max(1)
    }
}

fn default_db_path() -> String {
    "dwi_crawl.db".to_string()
}

fn default_error_caselist() -> PathBuf {
    PathBuf::from("error_caselist.txt")
}

fn default_dwipreproc_dir() -> String {
    "dwipreproc".to_string()
}

fn default_qqc_summary_file() -> String {
    "qqc_summary.csv".to_string()
}

fn default_lease_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl AppConfig {
    /// Configuration rooted at the given directories, every other value defaulted.
    pub fn with_roots(mri_root: impl Into<PathBuf>, source_root: impl Into<PathBuf>) -> Self {
        Self {
            mri_root: mri_root.into(),
            source_root: source_root.into(),
            manifest_path: PathBuf::from("subjects.csv"),
            db_path: default_db_path(),
            error_caselist: default_error_caselist(),
            dwipreproc_dir: default_dwipreproc_dir(),
            qqc_summary_file: default_qqc_summary_file(),
            lease_ttl_secs: default_lease_ttl_secs(),
            tools: ToolPaths::default(),
            pools: PoolSizes::default(),
        }
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.mri_root.join("derivatives")
    }
}

/// Load `Config.toml` from the working directory (or `path` when given),
/// layered with `DWI_CRAWL_*` environment variables.
pub fn load_configuration(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(path) => ConfigFile::from(path).required(true),
        None => ConfigFile::with_name("Config").required(false),
    };

    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("DWI_CRAWL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}
