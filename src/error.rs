//! Error types for avalanche using snafu.
//!
//! Every concern gets its own enum with context selectors. `PipelineError`
//! aggregates them for the stage runners, and `PipelineError::kind` maps
//! each failure onto the pipeline's error taxonomy.

use snafu::prelude::*;

// ============ Taxonomy ============

/// Classification of a failure as seen by operators and the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The HTTP data source did not return a usable payload.
    SourceUnavailable,
    /// A record is missing or carries a malformed required field.
    SchemaViolation,
    /// A partition key cannot be derived from an object identifier.
    MalformedIdentifier,
    /// A storage shard could not be read. Recovered locally.
    CorruptShard,
    /// A single row could not be delivered. Recovered locally.
    DeliverySkipped,
    /// Every row of a dispatch batch failed delivery.
    DispatchExhausted,
    /// The next stage could not be submitted.
    ChainBroken,
    /// Storage, catalog, configuration, or runtime failure.
    Internal,
}

impl ErrorKind {
    /// Whether the failure is handled inside the stage without failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::CorruptShard | ErrorKind::DeliverySkipped)
    }
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur while loading settings and stage arguments.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A boolean argument was neither `true` nor `false`.
    #[snafu(display("expected true or false, got '{value}'"))]
    InvalidFlag { value: String },

    /// A required argument was blank.
    #[snafu(display("value cannot be blank"))]
    BlankArgument,

    /// A required setting was empty.
    #[snafu(display("Setting {name} cannot be empty"))]
    EmptySetting { name: String },

    /// A catalog identifier contains characters that cannot be quoted safely.
    #[snafu(display("Invalid catalog identifier '{identifier}'"))]
    InvalidIdentifier { identifier: String },

    /// The stage table has no binding for a stage.
    #[snafu(display("No stage registered as '{name}' ({variant})"))]
    UnknownStage { name: String, variant: String },

    /// Worker count must be positive.
    #[snafu(display("Scaled worker count must be at least 1"))]
    ZeroWorkers,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Failed to build the HTTP client.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },
}

// ============ Fetch Errors ============

/// Errors raised by the ingest stage's HTTP source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FetchError {
    /// The source answered with a non-success status.
    #[snafu(display("Source {url} unavailable: HTTP {status}"))]
    SourceStatus { url: String, status: u16 },

    /// The request could not be completed.
    #[snafu(display("Source {url} unavailable: {source}"))]
    SourceRequest { url: String, source: reqwest::Error },

    /// The source answered 200 with a body that is not a batch of JSON objects.
    #[snafu(display("Source {url} returned an unusable payload: {message}"))]
    SourcePayload { url: String, message: String },
}

// ============ Transform Errors ============

/// Errors raised by the transform engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// A record does not satisfy the input contract.
    #[snafu(display("Schema violation in record {index}: {message}"))]
    SchemaViolation { index: usize, message: String },

    /// A scaled worker task did not complete.
    #[snafu(display("Transform worker failed: {source}"))]
    WorkerJoin { source: tokio::task::JoinError },
}

// ============ Identifier Errors ============

/// Errors raised while deriving a partition key.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IdentifierError {
    /// The object key does not embed a usable extraction timestamp.
    #[snafu(display("Malformed object identifier '{identifier}': {reason}"))]
    MalformedIdentifier { identifier: String, reason: String },
}

// ============ Shard Errors ============

/// A source shard that could not be decoded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ShardError {
    /// The shard has no content.
    #[snafu(display("Shard {path} is empty"))]
    EmptyShard { path: String },

    /// The shard content is not JSON.
    #[snafu(display("Shard {path} is corrupt: {message}"))]
    CorruptShard { path: String, message: String },

    /// The shard is JSON, but not a batch of objects.
    #[snafu(display("Shard {path} does not hold records: {message}"))]
    NotRecords { path: String, message: String },
}

impl ShardError {
    /// Unreadable shards are skipped. Shards that decode to something other
    /// than records are schema violations instead.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardError::EmptyShard { .. } | ShardError::CorruptShard { .. } => {
                ErrorKind::CorruptShard
            }
            ShardError::NotRecords { .. } => ErrorKind::SchemaViolation,
        }
    }
}

// ============ Parquet Errors ============

/// Errors that can occur during Parquet file writing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ParquetError {
    /// Parquet write error.
    #[snafu(display("Parquet write error: {source}"))]
    Write {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Failed to create Parquet writer.
    #[snafu(display("Failed to create Parquet writer: {source}"))]
    WriterCreate {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Writer is not available (internal state error).
    #[snafu(display("Parquet writer is not available"))]
    WriterUnavailable,

    /// Buffer lock error (mutex poisoned).
    #[snafu(display("Buffer lock failed: mutex poisoned"))]
    BufferLock,

    /// Buffer has outstanding references and cannot be consumed.
    #[snafu(display("Buffer has outstanding references"))]
    BufferInUse,
}

// ============ Catalog Errors ============

/// Errors that can occur while registering partitions in the Delta catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// Records could not be converted to Arrow.
    #[snafu(display("Failed to encode records as Arrow: {source}"))]
    ArrowEncode {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Failed to create struct type.
    #[snafu(display("Failed to create struct type: {message}"))]
    StructType { message: String },

    /// A column cannot be stored under the table's type for it.
    #[snafu(display(
        "Column {column} is {batch_type} in the batch but {table_type} in the table"
    ))]
    SchemaMismatch {
        column: String,
        table_type: String,
        batch_type: String,
    },

    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed: {source}"))]
    DeltaLake { source: deltalake::DeltaTableError },

    /// Failed to parse URL.
    #[snafu(display("Failed to parse table URL {url}: {source}"))]
    UrlParse { url: String, source: url::ParseError },

    /// Parquet encoding failed.
    #[snafu(display("Parquet error: {source}"))]
    CatalogParquet { source: ParquetError },

    /// Storage access for the table failed.
    #[snafu(display("Catalog storage error: {source}"))]
    CatalogStorage { source: StorageError },
}

// ============ Query Errors ============

/// Errors that can occur while reading a partition back.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    /// Listing or reading partition files failed.
    #[snafu(display("Query storage error: {source}"))]
    QueryStorage { source: StorageError },

    /// Opening the catalog table failed.
    #[snafu(display("Query catalog error: {source}"))]
    QueryCatalog { source: CatalogError },

    /// A partition file is not valid Parquet.
    #[snafu(display("Failed to read Parquet file {path}: {source}"))]
    ParquetRead {
        path: String,
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Decoding or projecting a record batch failed.
    #[snafu(display("Failed to decode rows from {path}: {source}"))]
    ArrowRead {
        path: String,
        source: deltalake::arrow::error::ArrowError,
    },

    /// A selected column is not present in the dataset.
    #[snafu(display("Column '{column}' not found in {path}"))]
    MissingColumn { column: String, path: String },
}

// ============ Delivery Errors ============

/// Failure to deliver a single row downstream. Recorded, never fatal alone.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DeliveryError {
    /// The request could not be completed.
    #[snafu(display("Delivery to {endpoint} failed: {source}"))]
    DeliveryRequest {
        endpoint: String,
        source: reqwest::Error,
    },

    /// The endpoint rejected the row.
    #[snafu(display("Delivery to {endpoint} rejected: HTTP {status}"))]
    DeliveryRejected { endpoint: String, status: u16 },

    /// The endpoint accepted the row but did not answer with JSON.
    #[snafu(display("Delivery to {endpoint} returned a non-JSON response: {source}"))]
    DeliveryResponse {
        endpoint: String,
        source: reqwest::Error,
    },
}

impl DeliveryError {
    /// A failed delivery only ever skips its row.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DeliverySkipped
    }
}

// ============ Launch Errors ============

/// Errors raised by job launchers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LaunchError {
    /// The launcher does not know how to run a job.
    #[snafu(display("Unknown job '{job_name}'"))]
    UnknownJob { job_name: String },

    /// The launcher has no record of a run.
    #[snafu(display("Unknown run '{run_id}' for job '{job_name}'"))]
    UnknownRun { job_name: String, run_id: String },

    /// The stage arguments could not be parsed.
    #[snafu(display("Invalid arguments for job '{job_name}': {message}"))]
    InvalidArguments { job_name: String, message: String },

    /// The launcher was dropped while a run was being submitted.
    #[snafu(display("Launcher for job '{job_name}' is shutting down"))]
    LauncherClosed { job_name: String },

    /// Checking a child process failed.
    #[snafu(display("Failed to poll run '{run_id}' of job '{job_name}': {source}"))]
    Poll {
        job_name: String,
        run_id: String,
        source: std::io::Error,
    },

    /// Spawning a child process failed.
    #[snafu(display("Failed to spawn job '{job_name}': {source}"))]
    Spawn {
        job_name: String,
        source: std::io::Error,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level stage errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error at {target}: {source}"))]
    PipelineStorage {
        target: String,
        source: StorageError,
    },

    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Fetching the source payload failed.
    #[snafu(display("{source}"))]
    Fetch { source: FetchError },

    /// Enrichment failed for the batch at `object_id`.
    #[snafu(display("Transform of {object_id} failed: {source}"))]
    Transform {
        object_id: String,
        source: TransformError,
    },

    /// Partition key derivation failed.
    #[snafu(display("{source}"))]
    Identifier { source: IdentifierError },

    /// The fetched batch could not be serialized for the raw bucket.
    #[snafu(display("Failed to encode batch {object_id}: {source}"))]
    RawEncode {
        object_id: String,
        source: serde_json::Error,
    },

    /// Batch at `object_id` has no readable shard.
    #[snafu(display("No shards found at {object_id}"))]
    NoShards { object_id: String },

    /// A readable shard contained something other than JSON objects.
    #[snafu(display("Schema violation in shard {path}: {message}"))]
    ShardSchema { path: String, message: String },

    /// Registering the partition failed.
    #[snafu(display("Catalog error for partition {partition}: {source}"))]
    Catalog {
        partition: String,
        source: CatalogError,
    },

    /// Reading a partition back failed.
    #[snafu(display("Query of partition {partition} failed: {source}"))]
    Query {
        partition: String,
        source: QueryError,
    },

    /// Every row of the partition failed delivery.
    #[snafu(display("All {attempted} deliveries for partition {partition} to {endpoint} failed"))]
    DispatchExhausted {
        partition: String,
        endpoint: String,
        attempted: usize,
    },

    /// Submitting the next stage failed.
    #[snafu(display("Could not submit next stage '{job_name}': {source}"))]
    ChainBroken {
        job_name: String,
        source: LaunchError,
    },

    /// The next stage does not follow the current one.
    #[snafu(display("Stage '{job_name}' cannot follow {from} (it would enter {to})"))]
    InvalidTransition {
        job_name: String,
        from: String,
        to: String,
    },

    /// The stage table could not resolve the next stage.
    #[snafu(display("Could not resolve next stage: {source}"))]
    ChainUnresolved { source: ConfigError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address: {source}"))]
    AddressParse { source: std::net::AddrParseError },
}

impl PipelineError {
    /// Map this error onto the pipeline taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Fetch { .. } => ErrorKind::SourceUnavailable,
            PipelineError::Transform {
                source: TransformError::SchemaViolation { .. },
                ..
            } => ErrorKind::SchemaViolation,
            PipelineError::ShardSchema { .. }
            | PipelineError::Catalog {
                source: CatalogError::SchemaMismatch { .. },
                ..
            } => ErrorKind::SchemaViolation,
            PipelineError::Identifier { .. } => ErrorKind::MalformedIdentifier,
            PipelineError::DispatchExhausted { .. } => ErrorKind::DispatchExhausted,
            PipelineError::ChainBroken { .. }
            | PipelineError::ChainUnresolved { .. }
            | PipelineError::InvalidTransition { .. } => ErrorKind::ChainBroken,
            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            PipelineError::PipelineStorage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
