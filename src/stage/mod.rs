//! Stage runners and the stage table.
//!
//! A stage run reads its inputs, produces one artifact, and hands the
//! artifact to the coordinator, which submits the next stage. The
//! [`StageTable`] maps the logical stage names used in arguments
//! (`next_glue_job`) and a [`Variant`] onto the job names a launcher knows.

pub mod dispatch;
pub mod ingest;
pub mod process;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::config::{LauncherKind, Settings, StageBindingConfig, StageCommand};
use crate::coordinator::launcher::{JobLauncher, LocalLauncher, ProcessLauncher};
use crate::coordinator::{Coordinator, PipelineState};
use crate::emit;
use crate::error::{ConfigError, HttpClientSnafu, PipelineError, UnknownStageSnafu};
use crate::metrics::events::{StageCompleted, StageOutcome};

pub use dispatch::DispatchReport;
pub use ingest::IngestReport;
pub use process::ProcessReport;

/// Which implementation of a stage to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Standard,
    /// Fans decoding and enrichment out to a worker pool.
    Scaled,
}

impl Variant {
    pub fn from_scaled(scaled: bool) -> Self {
        if scaled {
            Variant::Scaled
        } else {
            Variant::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Standard => "standard",
            Variant::Scaled => "scaled",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three kinds of stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Ingest,
    Process,
    Dispatch,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Ingest => "ingest",
            StageKind::Process => "process",
            StageKind::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the stage table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBinding {
    pub name: String,
    pub variant: Variant,
    pub kind: StageKind,
    pub job_name: String,
    pub default_arguments: HashMap<String, String>,
}

impl StageBinding {
    fn new(name: &str, variant: Variant, kind: StageKind, job_name: &str) -> Self {
        Self {
            name: name.to_string(),
            variant,
            kind,
            job_name: job_name.to_string(),
            default_arguments: HashMap::new(),
        }
    }

    /// Subcommand that runs this binding.
    ///
    /// Only the process stage has a scaled implementation; other kinds run
    /// their standard subcommand whatever the variant.
    pub fn subcommand(&self) -> &'static str {
        match (self.kind, self.variant) {
            (StageKind::Ingest, _) => "ingest",
            (StageKind::Process, Variant::Standard) => "process",
            (StageKind::Process, Variant::Scaled) => "process-spark",
            (StageKind::Dispatch, _) => "dispatch",
        }
    }
}

impl From<&StageBindingConfig> for StageBinding {
    fn from(config: &StageBindingConfig) -> Self {
        Self {
            name: config.name.clone(),
            variant: config.variant,
            kind: config.stage,
            job_name: config.job_name.clone(),
            default_arguments: config.default_arguments.clone(),
        }
    }
}

/// Lookup from `(logical name, variant)` to a stage binding.
#[derive(Debug, Clone)]
pub struct StageTable {
    bindings: Vec<StageBinding>,
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            bindings: vec![
                StageBinding::new("ingest", Variant::Standard, StageKind::Ingest, "ingest"),
                StageBinding::new("process", Variant::Standard, StageKind::Process, "process"),
                StageBinding::new(
                    "process",
                    Variant::Scaled,
                    StageKind::Process,
                    "process-spark",
                ),
                StageBinding::new("dispatch", Variant::Standard, StageKind::Dispatch, "dispatch"),
            ],
        }
    }
}

impl StageTable {
    /// Apply settings entries: an entry replaces the binding with the same
    /// name and variant, or adds a new one.
    pub fn with_overrides(mut self, overrides: &[StageBindingConfig]) -> Self {
        for config in overrides {
            let binding = StageBinding::from(config);
            match self
                .bindings
                .iter_mut()
                .find(|b| b.name == binding.name && b.variant == binding.variant)
            {
                Some(existing) => *existing = binding,
                None => self.bindings.push(binding),
            }
        }
        self
    }

    pub fn resolve(&self, name: &str, variant: Variant) -> Result<&StageBinding, ConfigError> {
        self.bindings
            .iter()
            .find(|b| b.name == name && b.variant == variant)
            .context(UnknownStageSnafu {
                name,
                variant: variant.as_str(),
            })
    }

    /// Binding registered under a launcher job name.
    pub fn binding_for_job(&self, job_name: &str) -> Option<&StageBinding> {
        self.bindings.iter().find(|b| b.job_name == job_name)
    }

    pub fn bindings(&self) -> &[StageBinding] {
        &self.bindings
    }
}

/// Everything a stage run needs, built once per process.
#[derive(Clone)]
pub struct StageContext {
    pub settings: Arc<Settings>,
    pub http: Client,
    pub stages: Arc<StageTable>,
    pub launcher: Arc<dyn JobLauncher>,
}

impl StageContext {
    /// Build the context and the launcher selected in `settings`.
    pub fn new(settings: Settings) -> Result<Self, ConfigError> {
        let settings = Arc::new(settings);
        let http = Client::builder()
            .timeout(settings.http.timeout())
            .build()
            .context(HttpClientSnafu)?;
        let stages = Arc::new(StageTable::default().with_overrides(&settings.stages));

        let launcher: Arc<dyn JobLauncher> = match settings.launcher {
            LauncherKind::Local => {
                LocalLauncher::new(settings.clone(), http.clone(), stages.clone())
            }
            LauncherKind::Process => Arc::new(ProcessLauncher::new(
                settings.origin.clone(),
                stages.clone(),
            )),
        };

        Ok(Self {
            settings,
            http,
            stages,
            launcher,
        })
    }

    /// Replace the launcher, keeping everything else.
    pub fn with_launcher(mut self, launcher: Arc<dyn JobLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.stages.clone(), self.launcher.clone())
    }
}

/// What a finished stage run produced.
#[derive(Debug)]
pub enum StageReport {
    Ingest(IngestReport),
    Process(ProcessReport),
    Dispatch(DispatchReport),
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageReport::Ingest(r) => write!(
                f,
                "ingest: {} records landed at {}, next stage {} run {} ({})",
                r.records, r.object_id, r.next.job_name, r.next.run_id, r.next.state
            ),
            StageReport::Process(r) => {
                write!(
                    f,
                    "process: {} records from {} shards ({} skipped) into partition {}",
                    r.records, r.shards, r.shards_skipped, r.partition
                )?;
                match &r.commit {
                    Some(commit) => write!(f, " at version {}", commit.version)?,
                    None => write!(f, " (nothing written)")?,
                }
                write!(
                    f,
                    ", next stage {} run {} ({})",
                    r.next.job_name, r.next.run_id, r.next.state
                )
            }
            StageReport::Dispatch(r) => write!(
                f,
                "dispatch: {} of {} rows of partition {} delivered, {} skipped",
                r.delivered, r.rows, r.partition, r.skipped
            ),
        }
    }
}

/// Run one stage to completion.
///
/// A run without a `pipeline_run_id` starts a new pipeline run.
pub async fn run(ctx: &StageContext, command: StageCommand) -> Result<StageReport, PipelineError> {
    let kind = command.kind();
    let variant = command.variant();
    let state = PipelineState::for_stage(kind, variant);
    let pipeline_run_id = command
        .run_args()
        .pipeline_run_id
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let span = info_span!("stage", stage = kind.as_str(), pipeline_run_id = %pipeline_run_id);
    async move {
        info!(
            variant = variant.as_str(),
            dry_run = command.run_args().dry_run,
            "Stage starting in state {}",
            state
        );
        let start = Instant::now();

        let result = match command {
            StageCommand::Ingest(args) => ingest::run(ctx, &args, &pipeline_run_id)
                .await
                .map(StageReport::Ingest),
            StageCommand::Process(args) => {
                process::run(ctx, &args, Variant::Standard, &pipeline_run_id)
                    .await
                    .map(StageReport::Process)
            }
            StageCommand::ProcessSpark(args) => {
                process::run(ctx, &args, Variant::Scaled, &pipeline_run_id)
                    .await
                    .map(StageReport::Process)
            }
            StageCommand::Dispatch(args) => dispatch::run(ctx, &args)
                .await
                .map(StageReport::Dispatch),
        };

        let outcome = match &result {
            Ok(report) => {
                info!("Stage finished: {}", report);
                StageOutcome::Succeeded
            }
            Err(e) => {
                error!(
                    kind = ?e.kind(),
                    "Stage failed, pipeline {} -> {}: {}",
                    state,
                    PipelineState::Failed,
                    e
                );
                StageOutcome::Failed
            }
        };
        emit!(StageCompleted {
            stage: kind.as_str(),
            outcome,
            duration: start.elapsed(),
        });

        result
    }
    .instrument(span)
    .await
}
