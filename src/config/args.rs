//! Command-line surface: one subcommand per stage.
//!
//! Argument names follow the job runner's conventions (`--s3_bucket_raw`,
//! `--DRYRUN`), so the same argument map can be replayed by any launcher.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::stage::{StageKind, Variant};

/// Chained batch pipeline: fetch, process, and dispatch bank records.
#[derive(Parser, Debug)]
#[command(name = "avalanche")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the settings file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: StageCommand,
}

/// A stage and its arguments.
#[derive(Subcommand, Debug, Clone)]
pub enum StageCommand {
    /// Fetch a batch from the HTTP source and land it in the raw bucket.
    Ingest(IngestArgs),
    /// Enrich a raw batch and overwrite its catalog partition.
    Process(ProcessArgs),
    /// Same as `process`, with decoding and enrichment fanned out to workers.
    #[command(name = "process-spark")]
    ProcessSpark(ProcessArgs),
    /// Forward rows of one catalog partition to an HTTP endpoint.
    Dispatch(DispatchArgs),
}

impl StageCommand {
    /// Build a command from a job's subcommand and argument map.
    pub fn from_arguments(
        subcommand: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<Self, clap::Error> {
        let mut argv = vec!["avalanche".to_string(), subcommand.to_string()];
        argv.extend(to_argv(arguments));
        Cli::try_parse_from(argv).map(|cli| cli.command)
    }

    pub fn kind(&self) -> StageKind {
        match self {
            StageCommand::Ingest(_) => StageKind::Ingest,
            StageCommand::Process(_) | StageCommand::ProcessSpark(_) => StageKind::Process,
            StageCommand::Dispatch(_) => StageKind::Dispatch,
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            StageCommand::ProcessSpark(_) => Variant::Scaled,
            _ => Variant::Standard,
        }
    }

    pub fn run_args(&self) -> &RunArgs {
        match self {
            StageCommand::Ingest(args) => &args.run,
            StageCommand::Process(args) | StageCommand::ProcessSpark(args) => &args.run,
            StageCommand::Dispatch(args) => &args.run,
        }
    }
}

/// Turn an argument map into `--name value` pairs, sorted by name.
pub fn to_argv(arguments: &HashMap<String, String>) -> Vec<String> {
    let mut names: Vec<&String> = arguments.keys().collect();
    names.sort();
    names
        .into_iter()
        .flat_map(|name| [format!("--{name}"), arguments[name].clone()])
        .collect()
}

/// Parse a boolean argument. Only `true` and `false` are accepted, in any case.
pub fn parse_flag(value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            value: value.to_string(),
        }),
    }
}

fn non_empty(value: &str) -> Result<String, ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::BlankArgument);
    }
    Ok(value.to_string())
}

/// Arguments every stage carries through the chain.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Suppress outbound deliveries in the dispatch stage.
    #[arg(long = "DRYRUN", action = ArgAction::Set, value_parser = parse_flag)]
    pub dry_run: bool,

    /// Correlates the stage runs of one pipeline run. Generated when absent.
    #[arg(long = "pipeline_run_id")]
    pub pipeline_run_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Base URL of the data source.
    #[arg(long = "base_data_url", value_parser = non_empty)]
    pub base_data_url: String,

    /// Dataset to fetch, appended to the base URL.
    #[arg(long = "data_spec", value_parser = non_empty)]
    pub data_spec: String,

    /// Number of records to request.
    #[arg(long = "data_size")]
    pub data_size: usize,

    /// Bucket (or URL) receiving raw batches.
    #[arg(long = "s3_bucket_raw", value_parser = non_empty)]
    pub s3_bucket_raw: String,

    /// Logical name of the next stage.
    #[arg(long = "next_glue_job", value_parser = non_empty)]
    pub next_glue_job: String,

    /// Select the scaled variant of the next stage.
    #[arg(
        long = "spark",
        action = ArgAction::Set,
        value_parser = parse_flag,
        default_value = "false"
    )]
    pub spark: bool,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ProcessArgs {
    /// Bucket (or URL) holding raw batches.
    #[arg(long = "s3_bucket_raw", value_parser = non_empty)]
    pub s3_bucket_raw: String,

    /// Bucket (or URL) holding catalog tables.
    #[arg(long = "s3_bucket_processed", value_parser = non_empty)]
    pub s3_bucket_processed: String,

    /// Key of the raw batch, relative to the raw bucket.
    #[arg(long = "s3_data_object_key", value_parser = non_empty)]
    pub s3_data_object_key: String,

    #[arg(long = "glue_database")]
    pub glue_database: String,

    #[arg(long = "glue_table")]
    pub glue_table: String,

    /// Logical name of the next stage.
    #[arg(long = "next_glue_job", value_parser = non_empty)]
    pub next_glue_job: String,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    /// Bucket (or URL) holding catalog tables.
    #[arg(long = "s3_bucket_processed", value_parser = non_empty)]
    pub s3_bucket_processed: String,

    /// Partition key to read.
    #[arg(long = "table_partition", value_parser = non_empty)]
    pub table_partition: String,

    #[arg(long = "glue_database")]
    pub glue_database: String,

    #[arg(long = "glue_table")]
    pub glue_table: String,

    /// Maximum number of rows to forward.
    #[arg(long = "limit_rows")]
    pub limit_rows: usize,

    /// Endpoint receiving one POST per row.
    #[arg(long = "endpoint", value_parser = non_empty)]
    pub endpoint: String,

    #[command(flatten)]
    pub run: RunArgs,
}
