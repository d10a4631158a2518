//! Object storage abstraction.
//!
//! Provides a unified interface over S3 and the local filesystem. Every
//! path handed to a `StorageProvider` is relative to the key prefix the
//! provider was created with.

mod local;
mod s3;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

pub use local::LocalConfig;
pub use s3::S3Config;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for the supported backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

/// Bare S3 bucket names, as passed in the stage arguments.
const BUCKET_NAME: &str = r"^[a-z0-9][a-z0-9\-\.]{1,61}[a-z0-9]$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
}

fn matchers() -> &'static Vec<(Backend, Regex)> {
    static MATCHERS: OnceLock<Vec<(Backend, Regex)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        [
            (Backend::S3, S3_PATH),
            (Backend::S3, S3_VIRTUAL),
            (Backend::S3, S3_ENDPOINT_URL),
            (Backend::S3, S3_URL),
            (Backend::Local, FILE_URI),
            (Backend::Local, FILE_PATH),
        ]
        .into_iter()
        .map(|(backend, pattern)| (backend, Regex::new(pattern).expect("valid storage pattern")))
        .collect()
    })
}

/// Turn a bucket argument into a storage URL.
///
/// Stage arguments name buckets the way the job runner knows them: a bare
/// bucket name means S3, while full URLs and absolute paths pass through.
pub fn bucket_url(bucket: &str) -> String {
    static BUCKET: OnceLock<Regex> = OnceLock::new();
    let bucket = bucket.trim_end_matches('/');
    let is_bare = BUCKET
        .get_or_init(|| Regex::new(BUCKET_NAME).expect("valid bucket pattern"))
        .is_match(bucket);
    if is_bare {
        format!("s3://{bucket}")
    } else {
        bucket.to_string()
    }
}

/// Join a relative key onto a storage URL.
pub fn join_url(base: &str, key: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        key.trim_start_matches('/')
    )
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, regex) in matchers() {
            if let Some(matches) = regex.captures(url) {
                return match backend {
                    Backend::S3 => Ok(Self::parse_s3(&matches)),
                    Backend::Local => Ok(Self::parse_local(&matches)),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches
            .name("key")
            .map(|m| Path::from(m.as_str().trim_end_matches('/')));

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_local(matches: &regex::Captures) -> Self {
        let path = matches.name("path").map(|m| m.as_str()).unwrap_or_default();
        let path = format!("/{}", path.trim_start_matches('/').trim_end_matches('/'));

        BackendConfig::Local(LocalConfig { path })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

fn request_status<T, E>(result: &Result<T, E>) -> RequestStatus {
    if result.is_ok() {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options),
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// The URL this provider was created for, normalized.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get storage options for external integrations (e.g., Delta Lake).
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = Path::from(path);
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: request_status(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });

        let bytes = result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Put a payload to a path. The write is durable once this returns.
    pub async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = Path::from(path);
        let path = self.qualify_path(&path);
        let start = Instant::now();
        let result = self
            .object_store
            .put(&path, PutPayload::from(bytes))
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: request_status(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Put,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        debug!("Wrote {} to {}", path, self.canonical_url);
        Ok(())
    }

    /// Delete a file.
    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let path = Path::from(path);
        let start = Instant::now();
        let result = self.object_store.delete(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Delete,
            status: request_status(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Delete,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)
    }

    /// List files under a prefix (relative to the configured key prefix).
    ///
    /// Returns sorted paths relative to the configured key prefix. A prefix
    /// with nothing beneath it yields an empty list.
    pub async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix: Path = match self.config.key() {
            Some(key) => key.parts().chain(Path::from(prefix).parts()).collect(),
            None => Path::from(prefix),
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        let start = Instant::now();
        let result: Result<Vec<_>, _> = self
            .object_store
            .list(Some(&full_prefix))
            .try_collect()
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: request_status(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::List,
            duration: start.elapsed(),
        });

        let objects = match result {
            Ok(objects) => objects,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(source) => return Err(StorageError::ObjectStore { source }),
        };

        // Strip the base prefix so callers get paths they can hand back to get()
        let mut paths: Vec<String> = objects
            .into_iter()
            .map(|meta| {
                meta.location
                    .parts()
                    .skip(key_part_count)
                    .collect::<Path>()
                    .to_string()
            })
            .collect();
        paths.sort();

        debug!(
            "Listed {} files under {}/{}",
            paths.len(),
            self.canonical_url,
            prefix
        );
        Ok(paths)
    }
}
