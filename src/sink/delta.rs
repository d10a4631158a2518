//! Delta Lake catalog tables.
//!
//! Each `(database, table)` pair is a Delta table partitioned by
//! `extraction_datetime`. Writing a partition replaces it: the commit
//! removes every file currently in the partition and adds the new files in
//! one transaction, so readers see either the old or the new partition and
//! other partitions are never touched.
//!
//! Batches are aligned to the table's schema before writing. Columns the
//! table has never seen are added with a `Metadata` action in the same
//! commit.

use deltalake::arrow::datatypes::{DataType as ArrowType, Field, Schema};
use deltalake::kernel::{Action, Add, DataType as DeltaType, Remove, StructField, StructType};
use deltalake::{DeltaTable, DeltaTableError, PartitionFilter, PartitionValue};
use deltalake::kernel::transaction::CommitBuilder;
use deltalake::operations::create::CreateBuilder;
use deltalake::protocol::{DeltaOperation, SaveMode};
use snafu::prelude::*;
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

use super::FinishedFile;
use super::encode::encode;
use super::parquet::{ParquetWriter, ParquetWriterConfig};
use super::schema::align_to_table;
use crate::emit;
use crate::error::{
    ArrowEncodeSnafu, CatalogError, CatalogParquetSnafu, CatalogStorageSnafu, DeltaLakeSnafu,
    StructTypeSnafu, UrlParseSnafu,
};
use crate::identifier::{PARTITION_COLUMN, PartitionKey};
use crate::metrics::events::DeltaCommitCompleted;
use crate::record::EnrichedRecordBatch;
use crate::storage::{BackendConfig, StorageProvider, StorageProviderRef};

const DELTA_LOG: &str = "_delta_log";

/// Result of replacing one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommit {
    pub version: i64,
    pub records: usize,
    pub files_added: usize,
    pub files_removed: usize,
}

/// A catalog table rooted at the given storage provider.
pub struct DeltaCatalog {
    storage: StorageProviderRef,
    table_url: String,
    table: Option<DeltaTable>,
    parquet: ParquetWriterConfig,
}

impl DeltaCatalog {
    /// Open the table at `storage`'s root, if one exists there.
    pub async fn open(
        storage: StorageProviderRef,
        parquet: ParquetWriterConfig,
    ) -> Result<Self, CatalogError> {
        deltalake::aws::register_handlers(None);

        let table_url = table_url(&storage);
        let has_log = !storage
            .list_with_prefix(DELTA_LOG)
            .await
            .context(CatalogStorageSnafu)?
            .is_empty();

        let table = if has_log {
            let url = Url::parse(&table_url).context(UrlParseSnafu { url: &table_url })?;
            let table = deltalake::open_table_with_storage_options(
                url,
                storage.storage_options().clone(),
            )
            .await
            .context(DeltaLakeSnafu)?;
            debug!(
                "Loaded Delta table {} at version {}",
                table_url,
                table.version().unwrap_or(-1)
            );
            Some(table)
        } else {
            None
        };

        Ok(Self {
            storage,
            table_url,
            table,
            parquet,
        })
    }

    pub fn exists(&self) -> bool {
        self.table.is_some()
    }

    pub fn table_url(&self) -> &str {
        &self.table_url
    }

    /// Storage rooted at the table directory.
    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    /// Current table version, if the table exists.
    pub fn version(&self) -> Option<i64> {
        self.table.as_ref().and_then(|t| t.version())
    }

    /// Arrow schema of the data columns, without the partition column.
    /// Empty when the table does not exist.
    pub fn data_schema(&self) -> Result<Schema, CatalogError> {
        match &self.table {
            Some(table) => data_schema(table),
            None => Ok(Schema::empty()),
        }
    }

    /// Files of the current table version in the given partition, relative
    /// to the table root.
    pub async fn partition_files(&self, key: &PartitionKey) -> Result<Vec<String>, CatalogError> {
        match &self.table {
            Some(table) => files_in_partition(table, key).await,
            None => Ok(Vec::new()),
        }
    }

    /// Replace the partition of `batch` with its records.
    ///
    /// An empty batch commits nothing and returns `None`.
    pub async fn overwrite_partition(
        &mut self,
        batch: &EnrichedRecordBatch,
    ) -> Result<Option<PartitionCommit>, CatalogError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let key = batch.partition();

        let record_batch = encode(batch.records(), &[PARTITION_COLUMN]).context(ArrowEncodeSnafu)?;
        let table = match &mut self.table {
            Some(table) => table,
            slot @ None => slot.insert(
                create_table(
                    &self.table_url,
                    self.storage.storage_options(),
                    &record_batch.schema(),
                )
                .await?,
            ),
        };

        let aligned = align_to_table(&data_schema(table)?, record_batch)?;
        let mut actions = Vec::new();
        if aligned.evolves_schema() {
            let names: Vec<&str> = aligned.new_fields.iter().map(|f| f.name().as_str()).collect();
            info!("Adding columns {:?} to {}", names, self.table_url);
            actions.push(evolved_metadata(table, &aligned.new_fields)?);
        }

        let mut writer = ParquetWriter::new(aligned.schema(), self.parquet.clone(), key.directory())
            .context(CatalogParquetSnafu)?;
        writer.write_batch(&aligned.batch).context(CatalogParquetSnafu)?;
        let files = writer.close().context(CatalogParquetSnafu)?;

        for file in &files {
            self.storage
                .put(&file.filename, file.bytes.clone())
                .await
                .context(CatalogStorageSnafu)?;
        }

        let replaced = files_in_partition(table, key).await?;
        actions.extend(replaced.iter().map(|path| remove_action(path, key)));
        actions.extend(files.iter().map(|file| add_action(file, key)));

        let version = commit(table, actions, key).await?;

        for path in &replaced {
            if let Err(e) = self.storage.delete(path).await {
                warn!("Failed to delete replaced file {}: {}", path, e);
            }
        }

        let replaced_partition = PartitionCommit {
            version,
            records: batch.len(),
            files_added: files.len(),
            files_removed: replaced.len(),
        };
        info!(
            "Replaced partition {}={} of {} at version {} ({} records, {} files added, {} removed)",
            PARTITION_COLUMN,
            key,
            self.table_url,
            replaced_partition.version,
            replaced_partition.records,
            replaced_partition.files_added,
            replaced_partition.files_removed
        );
        Ok(Some(replaced_partition))
    }
}

async fn create_table(
    table_url: &str,
    storage_options: &HashMap<String, String>,
    schema: &Schema,
) -> Result<DeltaTable, CatalogError> {
    info!("Creating Delta table at {}", table_url);

    let mut columns = schema
        .fields()
        .iter()
        .map(|field| {
            Ok(StructField::new(
                field.name(),
                delta_type(field.data_type())?,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, CatalogError>>()?;
    columns.push(StructField::new(PARTITION_COLUMN, DeltaType::STRING, false));

    CreateBuilder::new()
        .with_location(table_url)
        .with_columns(columns)
        .with_partition_columns(vec![PARTITION_COLUMN])
        .with_storage_options(storage_options.clone())
        .await
        .context(DeltaLakeSnafu)
}

/// Live files whose logged partition value is exactly `key`.
async fn files_in_partition(
    table: &DeltaTable,
    key: &PartitionKey,
) -> Result<Vec<String>, CatalogError> {
    let filter = PartitionFilter {
        key: PARTITION_COLUMN.to_string(),
        value: PartitionValue::Equal(key.as_str().to_string()),
    };

    let mut files: Vec<String> = table
        .get_files_by_partitions(&[filter])
        .await
        .context(DeltaLakeSnafu)?
        .into_iter()
        .map(|path| path.to_string())
        .collect();
    files.sort();
    Ok(files)
}

async fn commit(
    table: &mut DeltaTable,
    actions: Vec<Action>,
    key: &PartitionKey,
) -> Result<i64, CatalogError> {
    let start = Instant::now();
    let files_added = actions.iter().filter(|a| matches!(a, Action::Add(_))).count();
    let files_removed = actions
        .iter()
        .filter(|a| matches!(a, Action::Remove(_)))
        .count();

    let version = CommitBuilder::default()
        .with_actions(actions)
        .build(
            Some(table.snapshot().context(DeltaLakeSnafu)?),
            table.log_store(),
            DeltaOperation::Write {
                mode: SaveMode::Overwrite,
                partition_by: Some(vec![PARTITION_COLUMN.to_string()]),
                predicate: Some(format!("{PARTITION_COLUMN} = '{key}'")),
            },
        )
        .await
        .context(DeltaLakeSnafu)?
        .version;

    table.load().await.context(DeltaLakeSnafu)?;

    emit!(DeltaCommitCompleted {
        duration: start.elapsed(),
        files_added,
        files_removed,
    });

    Ok(version)
}

fn data_schema(table: &DeltaTable) -> Result<Schema, CatalogError> {
    let snapshot = table.snapshot().context(DeltaLakeSnafu)?;
    let fields = snapshot
        .schema()
        .fields()
        .filter(|field| field.name() != PARTITION_COLUMN)
        .map(|field| {
            Ok(Field::new(
                field.name(),
                arrow_type(field.data_type())?,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, CatalogError>>()?;
    Ok(Schema::new(fields))
}

/// Table metadata with `new_fields` appended to the schema.
#[allow(deprecated)]
fn evolved_metadata(table: &DeltaTable, new_fields: &[Field]) -> Result<Action, CatalogError> {
    use deltalake::kernel::MetadataExt;

    let snapshot = table.snapshot().context(DeltaLakeSnafu)?;
    let added = new_fields.iter().map(|field| -> Result<StructField, CatalogError> {
        Ok(StructField::new(
            field.name(),
            delta_type(field.data_type())?,
            true,
        ))
    });
    let schema = StructType::try_new(
        snapshot
            .schema()
            .fields()
            .cloned()
            .map(Ok)
            .chain(added),
    )?;

    let metadata = snapshot
        .metadata()
        .clone()
        .with_schema(&schema)
        .map_err(|source| DeltaTableError::Kernel { source })
        .context(DeltaLakeSnafu)?;
    Ok(Action::Metadata(metadata))
}

/// Delta URL of the table rooted at `storage`.
fn table_url(storage: &StorageProvider) -> String {
    match storage.config() {
        BackendConfig::S3(s3) => match &s3.key {
            Some(key) => format!("s3://{}/{}", s3.bucket, key),
            None => format!("s3://{}", s3.bucket),
        },
        BackendConfig::Local(local) => format!("file://{}", local.path),
    }
}

fn delta_type(arrow_type: &ArrowType) -> Result<DeltaType, CatalogError> {
    Ok(match arrow_type {
        ArrowType::Boolean => DeltaType::BOOLEAN,
        ArrowType::Int64 => DeltaType::LONG,
        ArrowType::Float64 => DeltaType::DOUBLE,
        ArrowType::Utf8 => DeltaType::STRING,
        other => {
            return StructTypeSnafu {
                message: format!("unsupported column type {other}"),
            }
            .fail();
        }
    })
}

fn arrow_type(delta_type: &DeltaType) -> Result<ArrowType, CatalogError> {
    Ok(match delta_type {
        t if *t == DeltaType::BOOLEAN => ArrowType::Boolean,
        t if *t == DeltaType::LONG => ArrowType::Int64,
        t if *t == DeltaType::DOUBLE => ArrowType::Float64,
        t if *t == DeltaType::STRING => ArrowType::Utf8,
        other => {
            return StructTypeSnafu {
                message: format!("unsupported table column type {other}"),
            }
            .fail();
        }
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn partition_values(key: &PartitionKey) -> HashMap<String, Option<String>> {
    HashMap::from([(PARTITION_COLUMN.to_string(), Some(key.as_str().to_string()))])
}

fn add_action(file: &FinishedFile, key: &PartitionKey) -> Action {
    Action::Add(Add {
        path: file.filename.clone(),
        size: file.size as i64,
        partition_values: partition_values(key),
        modification_time: now_millis(),
        data_change: true,
        ..Default::default()
    })
}

fn remove_action(path: &str, key: &PartitionKey) -> Action {
    Action::Remove(Remove {
        path: path.to_string(),
        deletion_timestamp: Some(now_millis()),
        data_change: true,
        extended_file_metadata: Some(true),
        partition_values: Some(partition_values(key)),
        ..Default::default()
    })
}
