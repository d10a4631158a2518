//! Reading raw batches back from object storage.
//!
//! A raw batch is either a single object at its key, or a directory of
//! shards below `{key}/` written by an external producer. Each shard holds
//! a JSON array of records or newline-delimited JSON objects.

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{
    CorruptShardSnafu, EmptyShardSnafu, NoShardsSnafu, NotRecordsSnafu, PipelineError,
    PipelineStorageSnafu, ShardError, TransformError,
};
use crate::identifier::ObjectIdentifier;
use crate::metrics::events::ShardSkipped;
use crate::record::RawRecordBatch;
use crate::storage::StorageProviderRef;

/// Outcome of reading a raw batch.
#[derive(Debug, Default)]
pub struct ShardsRead {
    /// Records of every readable shard, in shard order.
    pub batch: RawRecordBatch,
    /// Number of shards found.
    pub shards: usize,
    /// Shards that could not be decoded.
    pub skipped: Vec<ShardError>,
}

/// Reads raw batches from the raw bucket.
pub struct ShardReader {
    storage: StorageProviderRef,
}

impl ShardReader {
    pub fn new(storage: StorageProviderRef) -> Self {
        Self { storage }
    }

    /// Read and decode the batch at `object_id` on the calling task.
    pub async fn read(&self, object_id: &ObjectIdentifier) -> Result<ShardsRead, PipelineError> {
        let shards = self.fetch(object_id).await?;
        let decoded = shards
            .into_iter()
            .map(|(path, bytes)| decode_shard(&path, &bytes))
            .collect();
        collect(decoded)
    }

    /// Read the batch at `object_id`, decoding shards on up to `workers`
    /// blocking tasks. Shard order is preserved.
    pub async fn read_scaled(
        &self,
        object_id: &ObjectIdentifier,
        workers: usize,
    ) -> Result<ShardsRead, PipelineError> {
        let shards = self.fetch(object_id).await?;
        let decoded: Vec<Result<RawRecordBatch, ShardError>> = stream::iter(shards)
            .map(|(path, bytes)| tokio::task::spawn_blocking(move || decode_shard(&path, &bytes)))
            .buffered(workers.max(1))
            .map_err(|source| PipelineError::Transform {
                object_id: object_id.to_string(),
                source: TransformError::WorkerJoin { source },
            })
            .try_collect()
            .await?;
        collect(decoded)
    }

    async fn fetch(&self, object_id: &ObjectIdentifier) -> Result<Vec<(String, Bytes)>, PipelineError> {
        let key = object_id.as_str();
        match self.storage.get(key).await {
            Ok(bytes) => return Ok(vec![(key.to_string(), bytes)]),
            Err(e) if e.is_not_found() => {
                debug!("No object at {}, looking for shards below it", key);
            }
            Err(source) => {
                return Err(source).context(PipelineStorageSnafu { target: key });
            }
        }

        let paths = self
            .storage
            .list_with_prefix(key)
            .await
            .context(PipelineStorageSnafu { target: key })?;
        ensure!(!paths.is_empty(), NoShardsSnafu { object_id: key });

        let mut shards = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self
                .storage
                .get(&path)
                .await
                .context(PipelineStorageSnafu { target: &path })?;
            shards.push((path, bytes));
        }
        Ok(shards)
    }
}

fn collect(decoded: Vec<Result<RawRecordBatch, ShardError>>) -> Result<ShardsRead, PipelineError> {
    let mut read = ShardsRead {
        shards: decoded.len(),
        ..Default::default()
    };
    for shard in decoded {
        match shard {
            Ok(batch) => read.batch.extend(batch),
            Err(ShardError::NotRecords { path, message }) => {
                return Err(PipelineError::ShardSchema { path, message });
            }
            Err(e) => {
                warn!("Skipping shard ({:?}): {}", e.kind(), e);
                emit!(ShardSkipped);
                read.skipped.push(e);
            }
        }
    }
    Ok(read)
}

/// Decode one shard: a JSON document, or a sequence of them.
pub fn decode_shard(path: &str, bytes: &[u8]) -> Result<RawRecordBatch, ShardError> {
    ensure!(
        bytes.iter().any(|b| !b.is_ascii_whitespace()),
        EmptyShardSnafu { path }
    );

    let mut batch = RawRecordBatch::default();
    for value in serde_json::Deserializer::from_slice(bytes).into_iter::<Value>() {
        let value = value.map_err(|e| {
            CorruptShardSnafu {
                path,
                message: e.to_string(),
            }
            .build()
        })?;
        let records =
            RawRecordBatch::from_json(value).map_err(|message| NotRecordsSnafu { path, message }.build())?;
        batch.extend(records);
    }
    Ok(batch)
}
