//! HTTP data source for the ingest stage.

use reqwest::{Client, StatusCode};
use snafu::prelude::*;
use std::time::Instant;
use tracing::{error, info};

use crate::emit;
use crate::error::{FetchError, SourcePayloadSnafu, SourceRequestSnafu, SourceStatusSnafu};
use crate::metrics::events::{RecordsFetched, SourceFetchCompleted};
use crate::record::RawRecordBatch;

/// Client for `GET {base_url}/{spec}?size={size}`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, spec: &str, size: usize) -> String {
        format!("{}/{}?size={}", self.base_url, spec.trim_matches('/'), size)
    }

    /// Fetch one batch. Anything other than a 200 carrying JSON objects is an error.
    pub async fn fetch(&self, spec: &str, size: usize) -> Result<RawRecordBatch, FetchError> {
        let url = self.url(spec, size);
        let start = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context(SourceRequestSnafu { url: &url })?;
        let status = response.status();
        info!("HTTP call to endpoint {} returned a {} status code", url, status.as_u16());

        if status != StatusCode::OK {
            if status == StatusCode::BAD_REQUEST {
                error!("HTTP call to endpoint {} was not executed successfully", url);
            }
            return SourceStatusSnafu {
                url,
                status: status.as_u16(),
            }
            .fail();
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .context(SourceRequestSnafu { url: &url })?;
        emit!(SourceFetchCompleted {
            duration: start.elapsed()
        });

        let batch = RawRecordBatch::from_json(payload)
            .map_err(|message| SourcePayloadSnafu { url, message }.build())?;
        emit!(RecordsFetched {
            count: batch.len() as u64
        });
        Ok(batch)
    }
}
