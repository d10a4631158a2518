//! Catalog output: enriched batches as Parquet files in a partitioned
//! Delta Lake table.

pub mod delta;
pub mod encode;
pub mod parquet;
pub mod schema;

pub use delta::{DeltaCatalog, PartitionCommit};

/// A Parquet file ready to be uploaded and committed.
#[derive(Debug, Clone)]
pub struct FinishedFile {
    /// Path relative to the table root, including the partition directory.
    pub filename: String,
    /// The size of the file in bytes.
    pub size: usize,
    /// Number of records in the file.
    pub record_count: usize,
    /// The encoded file.
    pub bytes: bytes::Bytes,
}
