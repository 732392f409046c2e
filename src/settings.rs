//! Environment-driven configuration.
//!
//! Every knob has a default; deployments override via environment variables
//! with the same (upper-cased) name, e.g. `MAX_CONCURRENT=8`.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use convert_assets::AssetTools;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Jobs allowed in `pending`/`running` at once.
    pub max_concurrent: usize,
    /// Hours a terminal job's directories are kept before the sweeper runs.
    pub retention_hours: u64,
    pub sweep_interval_seconds: u64,
    /// Base of the adaptive budget.
    pub default_timeout_seconds: u64,
    /// Ceiling of the adaptive budget.
    pub max_timeout_seconds: u64,
    pub compiler_path: String,
    pub converter_path: String,
    pub vectorizer_path: String,
    pub rasterizer_path: String,
    pub package_installer_path: String,
    pub upload_root: PathBuf,
    pub output_root: PathBuf,
    pub max_file_size_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            retention_hours: 24,
            sweep_interval_seconds: 3600,
            default_timeout_seconds: 600,
            max_timeout_seconds: 1800,
            compiler_path: "tectonic".to_string(),
            converter_path: "latexmlc".to_string(),
            vectorizer_path: "dvisvgm".to_string(),
            rasterizer_path: "pdftoppm".to_string(),
            package_installer_path: "tlmgr".to_string(),
            upload_root: PathBuf::from("data/uploads"),
            output_root: PathBuf::from("data/outputs"),
            max_file_size_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a variable is present but cannot be
    /// parsed into its field's type.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Creates the upload/output roots if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors from directory creation.
    pub fn ensure_roots(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_root)?;
        std::fs::create_dir_all(&self.output_root)?;
        Ok(())
    }

    #[must_use]
    pub fn job_upload_dir(&self, job_id: &str) -> PathBuf {
        self.upload_root.join(job_id)
    }

    #[must_use]
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id)
    }

    /// Extraction destination inside a job's upload directory.
    #[must_use]
    pub fn extracted_dir(&self, job_id: &str) -> PathBuf {
        self.job_upload_dir(job_id).join("extracted")
    }

    #[must_use]
    pub fn asset_tools(&self) -> AssetTools {
        AssetTools {
            compiler: self.compiler_path.clone(),
            vectorizer: self.vectorizer_path.clone(),
            rasterizer: self.rasterizer_path.clone(),
        }
    }

    /// Points both roots into `base`, used by tests and ad-hoc runs.
    #[must_use]
    pub fn with_roots(mut self, base: &Path) -> Self {
        self.upload_root = base.join("uploads");
        self.output_root = base.join("outputs");
        self
    }
}
