//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a stage run.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when the ingest stage receives records from the source.
pub struct RecordsFetched {
    pub count: u64,
}

impl InternalEvent for RecordsFetched {
    fn emit(self) {
        trace!(count = self.count, "Records fetched");
        counter!("avalanche_records_fetched_total").increment(self.count);
    }
}

/// Event emitted when records are enriched by the transform engine.
pub struct RecordsEnriched {
    pub count: u64,
}

impl InternalEvent for RecordsEnriched {
    fn emit(self) {
        trace!(count = self.count, "Records enriched");
        counter!("avalanche_records_enriched_total").increment(self.count);
    }
}

/// Event emitted when bytes are written to Parquet files.
pub struct BytesWritten {
    pub bytes: u64,
}

impl InternalEvent for BytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes written");
        counter!("avalanche_bytes_written_total").increment(self.bytes);
    }
}

/// Event emitted when a source shard is skipped as corrupt.
pub struct ShardSkipped;

impl InternalEvent for ShardSkipped {
    fn emit(self) {
        trace!("Shard skipped");
        counter!("avalanche_shards_skipped_total").increment(1);
    }
}

/// Outcome of a single row delivery.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryStatus {
    Delivered,
    Skipped,
}

impl DeliveryStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Skipped => "skipped",
        }
    }
}

/// Event emitted for every row the dispatch stage attempts.
pub struct RowDispatched {
    pub status: DeliveryStatus,
}

impl InternalEvent for RowDispatched {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Row dispatched");
        counter!("avalanche_rows_dispatched_total", "status" => self.status.as_str())
            .increment(1);
    }
}

/// Outcome of a stage run.
#[derive(Debug, Clone, Copy)]
pub enum StageOutcome {
    Succeeded,
    Failed,
}

impl StageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded => "succeeded",
            StageOutcome::Failed => "failed",
        }
    }
}

/// Event emitted when a stage run finishes.
pub struct StageCompleted {
    pub stage: &'static str,
    pub outcome: StageOutcome,
    pub duration: Duration,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(
            stage = self.stage,
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Stage completed"
        );
        counter!(
            "avalanche_stage_runs_total",
            "stage" => self.stage,
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        histogram!("avalanche_stage_duration_seconds", "stage" => self.stage)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a downstream stage is submitted.
pub struct StageSubmitted {
    pub job_name: String,
}

impl InternalEvent for StageSubmitted {
    fn emit(self) {
        trace!(job_name = %self.job_name, "Stage submitted");
        counter!("avalanche_stage_submissions_total", "job" => self.job_name).increment(1);
    }
}

// ============================================================================
// Histogram events for timing
// ============================================================================

/// Event emitted when the source request completes.
pub struct SourceFetchCompleted {
    pub duration: Duration,
}

impl InternalEvent for SourceFetchCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Source fetch completed"
        );
        histogram!("avalanche_source_fetch_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a Parquet file write completes.
pub struct ParquetWriteCompleted {
    pub duration: Duration,
}

impl InternalEvent for ParquetWriteCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Parquet write completed"
        );
        histogram!("avalanche_parquet_write_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a Delta Lake commit completes.
pub struct DeltaCommitCompleted {
    pub duration: Duration,
    pub files_added: usize,
    pub files_removed: usize,
}

impl InternalEvent for DeltaCommitCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            files_added = self.files_added,
            files_removed = self.files_removed,
            "Delta commit completed"
        );
        histogram!("avalanche_delta_commit_duration_seconds").record(self.duration.as_secs_f64());
        counter!("avalanche_partition_files_replaced_total").increment(self.files_removed as u64);
    }
}

/// Event emitted when the number of busy scaled-transform workers changes.
pub struct ActiveTransformWorkers {
    pub count: usize,
}

impl InternalEvent for ActiveTransformWorkers {
    fn emit(self) {
        trace!(count = self.count, "Active transform workers");
        gauge!("avalanche_active_transform_workers").set(self.count as f64);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "avalanche_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "avalanche_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
