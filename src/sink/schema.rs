//! Aligning encoded batches with a catalog table's schema.
//!
//! Column types are inferred per batch, so two extractions of the same
//! dataset can disagree. The table schema wins: a column the table already
//! has is cast to the table's type when the cast cannot lose information.
//! A column the batch lacks, or holds only nulls for, becomes nulls of the
//! table's type. A column the table has never seen is appended as a
//! nullable field and reported so the caller can commit the merged schema.

use deltalake::arrow::array::{Array, ArrayRef, RecordBatch, new_null_array};
use deltalake::arrow::compute::cast;
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ArrowEncodeSnafu, CatalogError, SchemaMismatchSnafu};

/// A batch rewritten to the table's schema.
#[derive(Debug)]
pub struct AlignedBatch {
    pub batch: RecordBatch,
    /// Fields absent from the table, appended at the end of `batch`.
    pub new_fields: Vec<Field>,
}

impl AlignedBatch {
    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn evolves_schema(&self) -> bool {
        !self.new_fields.is_empty()
    }
}

/// Rewrite `batch` so its leading columns match `table` by name and type.
pub fn align_to_table(table: &Schema, batch: RecordBatch) -> Result<AlignedBatch, CatalogError> {
    let incoming = batch.schema();
    let by_name: HashMap<&str, usize> = incoming
        .fields()
        .iter()
        .enumerate()
        .map(|(index, field)| (field.name().as_str(), index))
        .collect();

    let mut fields: Vec<Arc<Field>> = Vec::with_capacity(incoming.fields().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(incoming.fields().len());

    for field in table.fields() {
        let column = match by_name.get(field.name().as_str()) {
            Some(&index) => {
                let column = batch.column(index);
                let batch_type = incoming.field(index).data_type();
                if batch_type == field.data_type() {
                    column.clone()
                } else if column.null_count() == column.len() {
                    new_null_array(field.data_type(), batch.num_rows())
                } else {
                    ensure!(
                        is_lossless_cast(batch_type, field.data_type()),
                        SchemaMismatchSnafu {
                            column: field.name(),
                            table_type: field.data_type().to_string(),
                            batch_type: batch_type.to_string(),
                        }
                    );
                    cast(column, field.data_type()).context(ArrowEncodeSnafu)?
                }
            }
            None => new_null_array(field.data_type(), batch.num_rows()),
        };
        fields.push(Arc::new(field.as_ref().clone().with_nullable(true)));
        columns.push(column);
    }

    let mut new_fields = Vec::new();
    for (field, column) in incoming.fields().iter().zip(batch.columns()) {
        if table.field_with_name(field.name()).is_err() {
            let field = field.as_ref().clone().with_nullable(true);
            fields.push(Arc::new(field.clone()));
            columns.push(column.clone());
            new_fields.push(field);
        }
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context(ArrowEncodeSnafu)?;
    Ok(AlignedBatch { batch, new_fields })
}

/// Casts that keep every value: anything to text, and integers to floats.
fn is_lossless_cast(from: &DataType, to: &DataType) -> bool {
    matches!(
        (from, to),
        (
            DataType::Boolean | DataType::Int64 | DataType::Float64,
            DataType::Utf8
        ) | (DataType::Int64, DataType::Float64)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltalake::arrow::array::{AsArray, Int64Array, StringArray};

    fn make_schema(fields: Vec<(&str, DataType)>) -> Schema {
        Schema::new(
            fields
                .into_iter()
                .map(|(name, data_type)| Field::new(name, data_type, true))
                .collect::<Vec<_>>(),
        )
    }

    fn batch(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
        RecordBatch::try_from_iter(columns).unwrap()
    }

    #[test]
    fn test_identical_schema_is_untouched() {
        let table = make_schema(vec![("uid", DataType::Utf8)]);
        let incoming = batch(vec![(
            "uid",
            Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
        )]);

        let aligned = align_to_table(&table, incoming).unwrap();
        assert!(!aligned.evolves_schema());
        assert_eq!(aligned.batch.num_rows(), 2);
        assert_eq!(aligned.schema().field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_integers_cast_to_table_text() {
        let table = make_schema(vec![("uid", DataType::Utf8), ("account_number", DataType::Utf8)]);
        let incoming = batch(vec![
            ("account_number", Arc::new(Int64Array::from(vec![7, 8])) as ArrayRef),
            ("uid", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
        ]);

        let aligned = align_to_table(&table, incoming).unwrap();
        let schema = aligned.schema();
        assert_eq!(schema.field(0).name(), "uid");
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(aligned.batch.column(0).as_string::<i32>().value(1), "2");
        assert_eq!(aligned.batch.column(1).as_string::<i32>().value(0), "7");
    }

    #[test]
    fn test_new_fields_are_appended() {
        let table = make_schema(vec![("uid", DataType::Utf8)]);
        let incoming = batch(vec![
            ("branch", Arc::new(StringArray::from(vec!["north"])) as ArrayRef),
            ("uid", Arc::new(StringArray::from(vec!["a"])) as ArrayRef),
        ]);

        let aligned = align_to_table(&table, incoming).unwrap();
        assert!(aligned.evolves_schema());
        assert_eq!(aligned.new_fields.len(), 1);
        assert_eq!(aligned.new_fields[0].name(), "branch");
        assert_eq!(aligned.schema().field(1).name(), "branch");
    }

    #[test]
    fn test_missing_columns_become_nulls() {
        let table = make_schema(vec![("uid", DataType::Utf8), ("branch", DataType::Utf8)]);
        let incoming = batch(vec![(
            "uid",
            Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef,
        )]);

        let aligned = align_to_table(&table, incoming).unwrap();
        assert_eq!(aligned.batch.num_columns(), 2);
        assert_eq!(aligned.batch.column(1).null_count(), 2);
    }

    #[test]
    fn test_all_null_column_takes_table_type() {
        let table = make_schema(vec![("account_number", DataType::Int64)]);
        let incoming = batch(vec![(
            "account_number",
            Arc::new(StringArray::from(vec![None::<&str>, None])) as ArrayRef,
        )]);

        let aligned = align_to_table(&table, incoming).unwrap();
        assert_eq!(aligned.schema().field(0).data_type(), &DataType::Int64);
        assert_eq!(aligned.batch.column(0).null_count(), 2);
    }

    #[test]
    fn test_narrowing_is_rejected() {
        let table = make_schema(vec![("account_number", DataType::Int64)]);
        let incoming = batch(vec![(
            "account_number",
            Arc::new(StringArray::from(vec!["0012"])) as ArrayRef,
        )]);

        let err = align_to_table(&table, incoming).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::SchemaMismatch { ref column, .. } if column == "account_number"
        ));
    }
}
