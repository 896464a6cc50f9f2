use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::rewards::OrphanPolicy;
use crate::section::SectionMarkers;

pub const DEFAULT_SCRATCH_DIR: &str = "simc_weekly_rewards_variants";
pub const DEFAULT_OUTPUT_FILE: &str = "data.json";
pub const DEFAULT_OUTPUT_KEY: &str = "json2";
pub const DEFAULT_METRIC: &str = "dps";

/// Settings for one pipeline invocation, usually read from `vault.yaml`.
///
/// Every field has a default, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Simulator program. Unset means "let the caller discover it".
    pub simc: Option<PathBuf>,
    /// Arguments placed before the variant path.
    pub simc_args: Vec<String>,
    /// Arguments placed after the variant path, e.g. `iterations=5000`.
    pub extra_args: Vec<String>,
    pub output_key: String,
    pub scratch_dir: PathBuf,
    pub output_file: String,
    pub metric: String,
    /// Parallel invocations; 0 means one per available core.
    pub jobs: usize,
    pub timeout_seconds: Option<u64>,
    pub kill_on_cancel: bool,
    pub markers: SectionMarkers,
    pub orphan_policy: OrphanPolicy,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            simc: None,
            simc_args: Vec::new(),
            extra_args: Vec::new(),
            output_key: DEFAULT_OUTPUT_KEY.to_string(),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            output_file: DEFAULT_OUTPUT_FILE.to_string(),
            metric: DEFAULT_METRIC.to_string(),
            jobs: 1,
            timeout_seconds: None,
            kill_on_cancel: true,
            markers: SectionMarkers::default(),
            orphan_policy: OrphanPolicy::Drop,
        }
    }
}

impl VaultConfig {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_yaml(&raw).map_err(|source| PipelineError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Worker count with `0` resolved to the machine's parallelism.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }
}
