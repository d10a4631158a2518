//! Dispatch: forward rows of one partition to the downstream endpoint.

use snafu::prelude::*;
use tracing::info;

use super::StageContext;
use super::process::open_storage;
use crate::config::DispatchArgs;
use crate::coordinator::PipelineState;
use crate::dispatch::DispatchSink;
use crate::error::{
    CatalogSnafu, ConfigSnafu, DispatchExhaustedSnafu, IdentifierSnafu, PipelineError, QuerySnafu,
};
use crate::identifier::{CatalogCoords, PartitionKey};
use crate::query::PartitionQuery;
use crate::sink::DeltaCatalog;
use crate::sink::parquet::ParquetWriterConfig;
use crate::storage::{bucket_url, join_url};

#[derive(Debug)]
pub struct DispatchReport {
    pub partition: PartitionKey,
    pub rows: usize,
    pub delivered: usize,
    pub skipped: usize,
}

pub async fn run(ctx: &StageContext, args: &DispatchArgs) -> Result<DispatchReport, PipelineError> {
    let coords = CatalogCoords::new(&args.glue_database, &args.glue_table).context(ConfigSnafu)?;
    let partition = PartitionKey::parse(&args.table_partition).context(IdentifierSnafu)?;
    let query = PartitionQuery::new(
        coords.clone(),
        partition.clone(),
        args.limit_rows,
        &ctx.settings.query.select_columns,
    )
    .context(ConfigSnafu)?;

    let table_url = join_url(&bucket_url(&args.s3_bucket_processed), &coords.table_path());
    let storage = open_storage(ctx, &table_url).await?;
    let catalog = DeltaCatalog::open(storage, ParquetWriterConfig::default())
        .await
        .context(CatalogSnafu {
            partition: partition.as_str(),
        })?;
    let rows = query.execute(&catalog).await.context(QuerySnafu {
        partition: partition.as_str(),
    })?;
    info!("Partition {} of {} returned {} rows", partition, coords, rows.len());

    let sink = DispatchSink::new(ctx.http.clone(), &args.endpoint, args.run.dry_run);
    let report = sink.send_all(&rows).await;
    ensure!(
        !report.is_exhausted(),
        DispatchExhaustedSnafu {
            partition: partition.as_str(),
            endpoint: sink.endpoint(),
            attempted: report.attempted,
        }
    );

    info!(
        "Pipeline {} -> {}",
        PipelineState::Dispatching,
        PipelineState::Done
    );
    Ok(DispatchReport {
        partition,
        rows: rows.len(),
        delivered: report.delivered,
        skipped: report.skipped.len(),
    })
}
