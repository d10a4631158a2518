//! Chaining between stages.
//!
//! When a stage has written its artifact, the coordinator resolves the next
//! stage through the stage table, packages the artifact into that stage's
//! arguments, submits it through a [`JobLauncher`], and polls its status
//! once. It never waits for the next stage to finish and never retries.

pub mod launcher;

use snafu::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::emit;
use crate::error::{
    ChainBrokenSnafu, ChainUnresolvedSnafu, InvalidTransitionSnafu, PipelineError,
};
use crate::identifier::{CatalogCoords, ObjectIdentifier, PartitionKey};
use crate::metrics::events::StageSubmitted;
use crate::stage::{StageBinding, StageKind, StageTable, Variant};

pub use launcher::{JobLauncher, LocalLauncher, ProcessLauncher};

/// Argument names shared with the job runner.
pub mod arg {
    pub const DRY_RUN: &str = "DRYRUN";
    pub const PIPELINE_RUN_ID: &str = "pipeline_run_id";
    pub const S3_BUCKET_RAW: &str = "s3_bucket_raw";
    pub const S3_BUCKET_PROCESSED: &str = "s3_bucket_processed";
    pub const S3_DATA_OBJECT_KEY: &str = "s3_data_object_key";
    pub const GLUE_DATABASE: &str = "glue_database";
    pub const GLUE_TABLE: &str = "glue_table";
    pub const TABLE_PARTITION: &str = "table_partition";
}

/// What a stage produced, as seen by the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// A raw batch in the raw bucket.
    RawObject {
        bucket: String,
        object_id: ObjectIdentifier,
    },
    /// A partition of a catalog table in the processed bucket.
    Partition {
        bucket: String,
        coords: CatalogCoords,
        key: PartitionKey,
    },
}

impl Artifact {
    fn arguments(&self) -> Vec<(&'static str, String)> {
        match self {
            Artifact::RawObject { bucket, object_id } => vec![
                (arg::S3_BUCKET_RAW, bucket.clone()),
                (arg::S3_DATA_OBJECT_KEY, object_id.to_string()),
            ],
            Artifact::Partition {
                bucket,
                coords,
                key,
            } => vec![
                (arg::S3_BUCKET_PROCESSED, bucket.clone()),
                (arg::GLUE_DATABASE, coords.database.clone()),
                (arg::GLUE_TABLE, coords.table.clone()),
                (arg::TABLE_PARTITION, key.to_string()),
            ],
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::RawObject { bucket, object_id } => write!(f, "{bucket}/{object_id}"),
            Artifact::Partition { coords, key, .. } => write!(f, "{coords}[{key}]"),
        }
    }
}

/// Arguments for one submission of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    pub job_name: String,
    pub arguments: HashMap<String, String>,
}

impl StageInvocation {
    /// The binding's default arguments, overridden by the artifact and the
    /// run-wide arguments.
    pub fn new(
        binding: &StageBinding,
        artifact: &Artifact,
        dry_run: bool,
        pipeline_run_id: &str,
    ) -> Self {
        let mut arguments = binding.default_arguments.clone();
        for (name, value) in artifact.arguments() {
            arguments.insert(name.to_string(), value);
        }
        arguments.insert(arg::DRY_RUN.to_string(), dry_run.to_string());
        arguments.insert(arg::PIPELINE_RUN_ID.to_string(), pipeline_run_id.to_string());
        Self {
            job_name: binding.job_name.clone(),
            arguments,
        }
    }
}

/// State of a submitted job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Submitted => "SUBMITTED",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the next stage, as reported back to the submitting stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatus {
    pub job_name: String,
    pub run_id: String,
    pub state: RunState,
}

/// Position of a pipeline run in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Fetching,
    Processing,
    ProcessingScaled,
    Dispatching,
    Done,
    Failed,
}

impl PipelineState {
    /// State a run is in while the given stage executes.
    pub fn for_stage(kind: StageKind, variant: Variant) -> Self {
        match (kind, variant) {
            (StageKind::Ingest, _) => PipelineState::Fetching,
            (StageKind::Process, Variant::Standard) => PipelineState::Processing,
            (StageKind::Process, Variant::Scaled) => PipelineState::ProcessingScaled,
            (StageKind::Dispatch, _) => PipelineState::Dispatching,
        }
    }

    /// Runs only move forward; any unfinished state may fail.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Fetching, Processing | ProcessingScaled)
                | (Processing | ProcessingScaled, Dispatching)
                | (Dispatching, Done)
                | (Fetching | Processing | ProcessingScaled | Dispatching, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Fetching => "FETCHING",
            PipelineState::Processing => "PROCESSING",
            PipelineState::ProcessingScaled => "PROCESSING_SCALED",
            PipelineState::Dispatching => "DISPATCHING",
            PipelineState::Done => "DONE",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the chain stands when a stage hands off.
#[derive(Debug, Clone, Copy)]
pub struct Handoff<'a> {
    /// State of the producing stage.
    pub from: PipelineState,
    /// Logical name of the next stage (`next_glue_job`).
    pub next_stage: &'a str,
    pub variant: Variant,
    pub dry_run: bool,
    pub pipeline_run_id: &'a str,
}

/// Submits the next stage of a run.
#[derive(Clone)]
pub struct Coordinator {
    stages: Arc<StageTable>,
    launcher: Arc<dyn JobLauncher>,
}

impl Coordinator {
    pub fn new(stages: Arc<StageTable>, launcher: Arc<dyn JobLauncher>) -> Self {
        Self { stages, launcher }
    }

    /// Build the invocation of the next stage without submitting it.
    pub fn invocation(
        &self,
        artifact: &Artifact,
        handoff: &Handoff<'_>,
    ) -> Result<StageInvocation, PipelineError> {
        let binding = self
            .stages
            .resolve(handoff.next_stage, handoff.variant)
            .context(ChainUnresolvedSnafu)?;

        let to = PipelineState::for_stage(binding.kind, binding.variant);
        ensure!(
            handoff.from.can_transition_to(to),
            InvalidTransitionSnafu {
                job_name: &binding.job_name,
                from: handoff.from.as_str(),
                to: to.as_str(),
            }
        );

        Ok(StageInvocation::new(
            binding,
            artifact,
            handoff.dry_run,
            handoff.pipeline_run_id,
        ))
    }

    /// Submit the next stage for `artifact` and poll its status once.
    ///
    /// A failed submission is `ChainBroken`; the artifact stays where it
    /// was written. A failed poll after a successful submission is only
    /// logged, and the run is reported as submitted.
    pub async fn advance(
        &self,
        artifact: &Artifact,
        handoff: &Handoff<'_>,
    ) -> Result<RunStatus, PipelineError> {
        let invocation = self.invocation(artifact, handoff)?;
        let job_name = invocation.job_name;

        let run_id = self
            .launcher
            .start_job_run(&job_name, &invocation.arguments)
            .await
            .context(ChainBrokenSnafu {
                job_name: &job_name,
            })?;
        emit!(StageSubmitted {
            job_name: job_name.clone()
        });
        info!(
            job_name = %job_name,
            run_id = %run_id,
            dry_run = handoff.dry_run,
            "Submitted next stage for {}",
            artifact
        );

        let state = match self.launcher.get_job_run(&job_name, &run_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not poll run {} of {}: {}", run_id, job_name, e);
                RunState::Submitted
            }
        };
        info!("Job {} run {} is {}", job_name, run_id, state);

        Ok(RunStatus {
            job_name,
            run_id,
            state,
        })
    }
}
