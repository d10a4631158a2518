//! Settings and stage arguments.
//!
//! Stage arguments arrive on the command line, one subcommand per stage
//! (see `args`). Everything that is not per-run lives in an optional YAML
//! settings file: storage credentials, the stage table, launcher choice,
//! and tuning knobs.

pub mod args;
mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, EmptySettingSnafu, ReadFileSnafu, YamlParseSnafu, ZeroWorkersSnafu};
use crate::stage::{StageKind, Variant};

pub use args::{Cli, DispatchArgs, IngestArgs, ProcessArgs, RunArgs, StageCommand, parse_flag};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Columns the dispatch stage reads from a partition.
pub const DEFAULT_SELECT_COLUMNS: [&str; 4] = ["composite_pk", "uid", "bank_name", "routing_number"];

/// Process-wide settings shared by every stage run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Options handed to the object store and Delta Lake (credentials, region, endpoint).
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default)]
    pub http: HttpSettings,
    /// How chained stages are started.
    #[serde(default)]
    pub launcher: LauncherKind,
    #[serde(default)]
    pub transform: TransformSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub parquet: ParquetSettings,
    /// Extra or replacement entries for the stage table.
    #[serde(default)]
    pub stages: Vec<StageBindingConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// File the settings were loaded from, forwarded to child processes.
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

/// HTTP client settings for the source fetch and dispatch deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// Which launcher submits chained stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// Run chained stages as tasks inside this process.
    #[default]
    Local,
    /// Run each chained stage as a child process of this binary.
    Process,
}

/// Settings for the scaled transform variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSettings {
    /// Number of blocking workers used by `process-spark`.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Settings for the dispatch query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    #[serde(default = "default_select_columns")]
    pub select_columns: Vec<String>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            select_columns: default_select_columns(),
        }
    }
}

fn default_select_columns() -> Vec<String> {
    DEFAULT_SELECT_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Parquet output settings for the catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetSettings {
    #[serde(default)]
    pub compression: ParquetCompression,
    /// Roll to a new file once the current one reaches this size.
    #[serde(default = "default_file_size_mb")]
    pub file_size_mb: usize,
}

impl Default for ParquetSettings {
    fn default() -> Self {
        Self {
            compression: ParquetCompression::default(),
            file_size_mb: default_file_size_mb(),
        }
    }
}

fn default_file_size_mb() -> usize {
    128
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
}

/// One stage table entry from the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBindingConfig {
    /// Logical name used by `next_glue_job`.
    pub name: String,
    #[serde(default)]
    pub variant: Variant,
    /// Which stage the job runs.
    pub stage: StageKind,
    /// Job name the launcher knows the stage by.
    pub job_name: String,
    /// Arguments the job receives unless the invocation overrides them.
    #[serde(default)]
    pub default_arguments: HashMap<String, String>,
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Off by default: stage runs are short batch jobs.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Settings {
    /// Load settings from a YAML file, interpolating environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        let mut settings = Self::from_yaml(&vars::interpolate(&content)?)?;
        settings.origin = Some(path.as_ref().to_path_buf());
        Ok(settings)
    }

    /// Parse settings from YAML text that has already been interpolated.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(content).context(YamlParseSnafu)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.transform.workers > 0, ZeroWorkersSnafu);
        ensure!(
            !self.query.select_columns.is_empty(),
            EmptySettingSnafu {
                name: "query.select_columns"
            }
        );
        for binding in &self.stages {
            ensure!(
                !binding.job_name.is_empty(),
                EmptySettingSnafu {
                    name: format!("stages.{}.job_name", binding.name)
                }
            );
        }
        Ok(())
    }
}
