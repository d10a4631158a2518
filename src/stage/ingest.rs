//! Ingest: fetch one batch from the HTTP source and land it in the raw bucket.

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use tracing::info;

use super::{StageContext, Variant};
use crate::config::IngestArgs;
use crate::coordinator::{Artifact, Handoff, PipelineState, RunStatus};
use crate::error::{FetchSnafu, PipelineError, PipelineStorageSnafu, RawEncodeSnafu};
use crate::identifier::ObjectIdentifier;
use crate::source::HttpSource;
use crate::storage::{StorageProvider, bucket_url};

#[derive(Debug)]
pub struct IngestReport {
    pub object_id: ObjectIdentifier,
    pub records: usize,
    pub next: RunStatus,
}

pub async fn run(
    ctx: &StageContext,
    args: &IngestArgs,
    pipeline_run_id: &str,
) -> Result<IngestReport, PipelineError> {
    let source = HttpSource::new(ctx.http.clone(), &args.base_data_url);
    let batch = source
        .fetch(&args.data_spec, args.data_size)
        .await
        .context(FetchSnafu)?;

    let object_id = ObjectIdentifier::mint(Utc::now());
    let payload = batch
        .to_json_bytes()
        .context(RawEncodeSnafu { object_id: object_id.as_str() })?;

    let raw_url = bucket_url(&args.s3_bucket_raw);
    let storage =
        StorageProvider::for_url_with_options(&raw_url, ctx.settings.storage_options.clone())
            .await
            .context(PipelineStorageSnafu { target: &raw_url })?;
    storage
        .put(object_id.as_str(), Bytes::from(payload))
        .await
        .context(PipelineStorageSnafu {
            target: object_id.as_str(),
        })?;
    info!(
        records = batch.len(),
        "Landed batch at {}/{}",
        storage.canonical_url(),
        object_id
    );

    let artifact = Artifact::RawObject {
        bucket: args.s3_bucket_raw.clone(),
        object_id: object_id.clone(),
    };
    let next = ctx
        .coordinator()
        .advance(
            &artifact,
            &Handoff {
                from: PipelineState::Fetching,
                next_stage: &args.next_glue_job,
                variant: Variant::from_scaled(args.spark),
                dry_run: args.run.dry_run,
                pipeline_run_id,
            },
        )
        .await?;

    Ok(IngestReport {
        object_id,
        records: batch.len(),
        next,
    })
}
