//! avalanche: run one pipeline stage.
//!
//! Each invocation runs a single stage (`ingest`, `process`,
//! `process-spark`, or `dispatch`) with Glue-style `--name value`
//! arguments. On success the stage submits the next one; with the local
//! launcher the whole chain runs in this process before it exits.

use clap::Parser;
use snafu::prelude::*;
use tracing::{debug, info};

use avalanche::config::{Cli, Settings};
use avalanche::error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, PipelineError};
use avalanche::stage::{self, StageContext};
use avalanche::{logging, metrics};

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let settings = Settings::load(cli.config.as_deref()).context(ConfigSnafu)?;

    if settings.metrics.enabled {
        let addr = settings.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            settings.metrics.address
        );
    }

    let ctx = StageContext::new(settings).context(ConfigSnafu)?;
    info!("avalanche starting {}", cli.command.kind());

    let report = stage::run(&ctx, cli.command).await;

    // Chained stages started in-process finish before we exit.
    ctx.launcher.wait_idle().await;

    let report = report?;
    info!("Stage completed successfully");
    info!("  {}", report);
    Ok(())
}
