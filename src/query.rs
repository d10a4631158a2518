//! Partition queries for the dispatch stage.
//!
//! A [`PartitionQuery`] selects a fixed list of columns from exactly one
//! partition of a catalog table, up to a row limit. Identifiers are
//! validated and quoted when the query is built; the partition key and the
//! limit are parameters and never spliced into query text.
//!
//! Execution reads the partition's live files straight from the Delta log,
//! so a partition that was overwritten mid-flight is read either whole
//! before or whole after the overwrite.

use deltalake::arrow::array::{Array, ArrayRef, AsArray, RecordBatch};
use deltalake::arrow::datatypes::{DataType, Float64Type, Int64Type, Schema};
use deltalake::arrow::error::ArrowError;
use deltalake::arrow::util::display::array_value_to_string;
use deltalake::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::{Number, Value};
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{
    ArrowReadSnafu, ConfigError, MissingColumnSnafu, ParquetReadSnafu, QueryCatalogSnafu,
    QueryError, QueryStorageSnafu,
};
use crate::identifier::{CatalogCoords, PARTITION_COLUMN, PartitionKey, validate_sql_identifier};
use crate::record::Row;
use crate::sink::DeltaCatalog;

/// A value bound to a query placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Text(String),
    Integer(usize),
}

/// Rows of one partition, limited.
#[derive(Debug, Clone)]
pub struct PartitionQuery {
    coords: CatalogCoords,
    partition: PartitionKey,
    limit: usize,
    columns: Vec<String>,
}

impl PartitionQuery {
    pub fn new(
        coords: CatalogCoords,
        partition: PartitionKey,
        limit: usize,
        columns: &[String],
    ) -> Result<Self, ConfigError> {
        for column in columns {
            validate_sql_identifier(column)?;
        }
        Ok(Self {
            coords,
            partition,
            limit,
            columns: columns.to_vec(),
        })
    }

    pub fn coords(&self) -> &CatalogCoords {
        &self.coords
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Query text with `$1` bound to the partition key and `$2` to the limit.
    pub fn to_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT {columns} FROM {} WHERE \"{PARTITION_COLUMN}\" = $1 LIMIT $2",
            self.coords.quoted()
        )
    }

    /// Values for the placeholders of [`Self::to_sql`], in order.
    pub fn params(&self) -> [QueryParam; 2] {
        [
            QueryParam::Text(self.partition.as_str().to_string()),
            QueryParam::Integer(self.limit),
        ]
    }

    /// Run the query against `catalog`.
    ///
    /// A table that does not exist yet has no rows.
    pub async fn execute(&self, catalog: &DeltaCatalog) -> Result<Vec<Row>, QueryError> {
        info!(
            sql = %self.to_sql(),
            partition = %self.partition,
            limit = self.limit,
            "Querying {}",
            self.coords
        );
        if !catalog.exists() {
            warn!(
                "Table {} does not exist at {}, partition {} has no rows",
                self.coords,
                catalog.table_url(),
                self.partition
            );
            return Ok(Vec::new());
        }
        if self.limit == 0 {
            return Ok(Vec::new());
        }

        let files = catalog
            .partition_files(&self.partition)
            .await
            .context(QueryCatalogSnafu)?;
        debug!("Partition {} has {} files", self.partition, files.len());
        let table_schema = catalog.data_schema().context(QueryCatalogSnafu)?;

        let mut rows = Vec::new();
        'files: for path in &files {
            let bytes = catalog
                .storage()
                .get(path)
                .await
                .context(QueryStorageSnafu)?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
                .context(ParquetReadSnafu { path })?
                .build()
                .context(ParquetReadSnafu { path })?;

            for batch in reader {
                let batch = batch.context(ArrowReadSnafu { path })?;
                let columns = self.project(&batch, &table_schema, path)?;
                for index in 0..batch.num_rows() {
                    if rows.len() == self.limit {
                        break 'files;
                    }
                    rows.push(self.row(&columns, index).context(ArrowReadSnafu { path })?);
                }
            }
        }

        Ok(rows)
    }

    fn project<'a>(
        &self,
        batch: &'a RecordBatch,
        table_schema: &Schema,
        path: &str,
    ) -> Result<Vec<Projected<'a>>, QueryError> {
        self.columns
            .iter()
            .map(|column| {
                if column == PARTITION_COLUMN {
                    return Ok(Projected::Partition);
                }
                match batch.column_by_name(column) {
                    Some(array) => Ok(Projected::Stored(array)),
                    // Added to the table after this file was written.
                    None if table_schema.field_with_name(column).is_ok() => Ok(Projected::Absent),
                    None => MissingColumnSnafu { column, path }.fail(),
                }
            })
            .collect()
    }

    fn row(&self, columns: &[Projected<'_>], index: usize) -> Result<Row, ArrowError> {
        let mut row = Row::new();
        for (name, column) in self.columns.iter().zip(columns) {
            let value = match column {
                Projected::Stored(array) => json_value(array, index)?,
                // Stored in the log, not in the files.
                Projected::Partition => Value::String(self.partition.as_str().to_string()),
                Projected::Absent => Value::Null,
            };
            row.insert(name.clone(), value);
        }
        Ok(row)
    }
}

/// Where a selected column's values come from.
enum Projected<'a> {
    Stored(&'a ArrayRef),
    Partition,
    Absent,
}

fn json_value(array: &ArrayRef, index: usize) -> Result<Value, ArrowError> {
    if array.is_null(index) {
        return Ok(Value::Null);
    }
    Ok(match array.data_type() {
        DataType::Boolean => Value::Bool(array.as_boolean().value(index)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(index)),
        DataType::Float64 => Number::from_f64(array.as_primitive::<Float64Type>().value(index))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(index).to_string()),
        _ => Value::String(array_value_to_string(array, index)?),
    })
}
