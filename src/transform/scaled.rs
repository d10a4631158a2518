//! Scaled transform: the batch is split into contiguous chunks that are
//! enriched on blocking workers and reassembled in order.

use futures::{StreamExt, TryStreamExt, stream};
use snafu::prelude::*;
use tracing::debug;

use super::enrich_records;
use crate::emit;
use crate::error::{TransformError, WorkerJoinSnafu};
use crate::identifier::PartitionKey;
use crate::metrics::events::ActiveTransformWorkers;
use crate::record::{EnrichedRecordBatch, RawRecord, RawRecordBatch};

/// Enrich a batch on up to `workers` blocking tasks.
///
/// Output order and error reporting match [`super::enrich`]: chunks are
/// collected in input order, so the reported record is the first invalid
/// one in the batch regardless of which worker finished first.
pub async fn enrich_scaled(
    batch: RawRecordBatch,
    extraction_datetime: &PartitionKey,
    workers: usize,
) -> Result<EnrichedRecordBatch, TransformError> {
    let workers = workers.max(1);
    let chunks = split(batch.into_records(), workers);
    debug!(
        "Enriching {} chunks on {} workers",
        chunks.len(),
        workers
    );
    emit!(ActiveTransformWorkers {
        count: chunks.len().min(workers),
    });

    let results: Result<Vec<Vec<RawRecord>>, TransformError> = stream::iter(chunks)
        .map(|(offset, records)| {
            let key = extraction_datetime.clone();
            tokio::task::spawn_blocking(move || enrich_records(&records, offset, &key))
        })
        .buffered(workers)
        .map(|joined| joined.context(WorkerJoinSnafu)?)
        .try_collect()
        .await;

    emit!(ActiveTransformWorkers { count: 0 });

    let records = results?.into_iter().flatten().collect();
    Ok(EnrichedRecordBatch::new(extraction_datetime.clone(), records))
}

/// Split records into at most `parts` contiguous chunks, each tagged with
/// the batch index of its first record.
fn split(mut records: Vec<RawRecord>, parts: usize) -> Vec<(usize, Vec<RawRecord>)> {
    if records.is_empty() {
        return Vec::new();
    }
    let chunk_size = records.len().div_ceil(parts);
    let mut chunks = Vec::with_capacity(parts);
    let mut offset = 0;
    while !records.is_empty() {
        let rest = records.split_off(chunk_size.min(records.len()));
        let chunk = std::mem::replace(&mut records, rest);
        let len = chunk.len();
        chunks.push((offset, chunk));
        offset += len;
    }
    chunks
}
