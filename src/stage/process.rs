//! Process: enrich a raw batch and overwrite its partition in the catalog.
//!
//! Both variants share this runner. The scaled one decodes shards and
//! enriches records on `transform.workers` blocking tasks.

use snafu::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use super::{StageContext, StageKind, Variant};
use crate::config::ProcessArgs;
use crate::coordinator::{Artifact, Handoff, PipelineState, RunStatus};
use crate::emit;
use crate::error::{
    CatalogSnafu, ConfigSnafu, IdentifierSnafu, PipelineError, PipelineStorageSnafu,
    TransformSnafu,
};
use crate::identifier::{CatalogCoords, ObjectIdentifier, PartitionKey, derive_partition_key};
use crate::metrics::events::RecordsEnriched;
use crate::sink::parquet::ParquetWriterConfig;
use crate::sink::{DeltaCatalog, PartitionCommit};
use crate::source::ShardReader;
use crate::storage::{StorageProvider, StorageProviderRef, bucket_url, join_url};
use crate::transform::{enrich, enrich_scaled};

#[derive(Debug)]
pub struct ProcessReport {
    pub object_id: ObjectIdentifier,
    pub partition: PartitionKey,
    pub records: usize,
    pub shards: usize,
    pub shards_skipped: usize,
    /// `None` when the batch had no records and nothing was written.
    pub commit: Option<PartitionCommit>,
    pub next: RunStatus,
}

pub async fn run(
    ctx: &StageContext,
    args: &ProcessArgs,
    variant: Variant,
    pipeline_run_id: &str,
) -> Result<ProcessReport, PipelineError> {
    let object_id = ObjectIdentifier::new(&args.s3_data_object_key);
    let coords = CatalogCoords::new(&args.glue_database, &args.glue_table).context(ConfigSnafu)?;
    let partition = derive_partition_key(&object_id).context(IdentifierSnafu)?;
    let workers = ctx.settings.transform.workers;

    let raw = open_storage(ctx, &bucket_url(&args.s3_bucket_raw)).await?;
    let reader = ShardReader::new(raw);
    let read = match variant {
        Variant::Standard => reader.read(&object_id).await?,
        Variant::Scaled => reader.read_scaled(&object_id, workers).await?,
    };
    info!(
        shards = read.shards,
        skipped = read.skipped.len(),
        "Read {} records from {}",
        read.batch.len(),
        object_id
    );

    let enriched = match variant {
        Variant::Standard => enrich(&read.batch, &partition),
        Variant::Scaled => enrich_scaled(read.batch, &partition, workers).await,
    }
    .context(TransformSnafu {
        object_id: object_id.as_str(),
    })?;
    emit!(RecordsEnriched {
        count: enriched.len() as u64
    });

    let table_url = join_url(&bucket_url(&args.s3_bucket_processed), &coords.table_path());
    let table_storage = open_storage(ctx, &table_url).await?;
    let mut catalog = DeltaCatalog::open(
        table_storage,
        ParquetWriterConfig::from(&ctx.settings.parquet),
    )
    .await
    .context(CatalogSnafu {
        partition: partition.as_str(),
    })?;
    let commit = catalog
        .overwrite_partition(&enriched)
        .await
        .context(CatalogSnafu {
            partition: partition.as_str(),
        })?;
    if commit.is_none() {
        warn!(
            "Batch {} has no records, partition {} of {} left untouched",
            object_id, partition, coords
        );
    }

    let artifact = Artifact::Partition {
        bucket: args.s3_bucket_processed.clone(),
        coords,
        key: partition.clone(),
    };
    let next = ctx
        .coordinator()
        .advance(
            &artifact,
            &Handoff {
                from: PipelineState::for_stage(StageKind::Process, variant),
                next_stage: &args.next_glue_job,
                variant: Variant::Standard,
                dry_run: args.run.dry_run,
                pipeline_run_id,
            },
        )
        .await?;

    Ok(ProcessReport {
        object_id,
        partition,
        records: enriched.len(),
        shards: read.shards,
        shards_skipped: read.skipped.len(),
        commit,
        next,
    })
}

pub(super) async fn open_storage(
    ctx: &StageContext,
    url: &str,
) -> Result<StorageProviderRef, PipelineError> {
    let storage = StorageProvider::for_url_with_options(url, ctx.settings.storage_options.clone())
        .await
        .context(PipelineStorageSnafu { target: url })?;
    Ok(Arc::new(storage))
}
