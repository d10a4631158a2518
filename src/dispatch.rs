//! Delivery of query rows to a downstream HTTP endpoint.

use reqwest::Client;
use serde_json::Value;
use snafu::prelude::*;
use tracing::{info, warn};

use crate::emit;
use crate::error::{
    DeliveryError, DeliveryRejectedSnafu, DeliveryRequestSnafu, DeliveryResponseSnafu,
};
use crate::metrics::events::{DeliveryStatus, RowDispatched};
use crate::record::Row;

/// Tally of one dispatch run.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub skipped: Vec<DeliveryError>,
}

impl DeliveryReport {
    /// True when rows were attempted and none got through.
    pub fn is_exhausted(&self) -> bool {
        self.attempted > 0 && self.delivered == 0
    }
}

/// Posts each row, as JSON, to one endpoint.
#[derive(Debug, Clone)]
pub struct DispatchSink {
    client: Client,
    endpoint: String,
    dry_run: bool,
}

impl DispatchSink {
    pub fn new(client: Client, endpoint: impl Into<String>, dry_run: bool) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            dry_run,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Deliver one row and return the endpoint's JSON answer.
    ///
    /// In dry-run mode the row is only logged and the answer is the row itself.
    pub async fn send(&self, row: &Row) -> Result<Value, DeliveryError> {
        if self.dry_run {
            let row = Value::Object(row.clone());
            info!(endpoint = %self.endpoint, "Dry run, not sending row: {}", row);
            return Ok(row);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(row)
            .send()
            .await
            .context(DeliveryRequestSnafu {
                endpoint: &self.endpoint,
            })?;

        let status = response.status();
        ensure!(
            status.is_success(),
            DeliveryRejectedSnafu {
                endpoint: &self.endpoint,
                status: status.as_u16(),
            }
        );

        response.json().await.context(DeliveryResponseSnafu {
            endpoint: &self.endpoint,
        })
    }

    /// Deliver every row in order. Failed rows are recorded and skipped.
    pub async fn send_all(&self, rows: &[Row]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for row in rows {
            report.attempted += 1;
            match self.send(row).await {
                Ok(answer) => {
                    info!("Row delivered, endpoint answered: {}", answer);
                    emit!(RowDispatched {
                        status: DeliveryStatus::Delivered
                    });
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(
                        "Skipping row {} ({:?}): {}",
                        report.attempted - 1,
                        e.kind(),
                        e
                    );
                    emit!(RowDispatched {
                        status: DeliveryStatus::Skipped
                    });
                    report.skipped.push(e);
                }
            }
        }
        report
    }
}
