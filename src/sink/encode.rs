//! JSON records to Arrow.
//!
//! Column types are inferred from the batch: booleans, integers, and
//! floats keep their type when every non-null value agrees (integers widen
//! to floats). Everything else, including nested values, is stored as
//! text, nested values as their JSON encoding.

use deltalake::arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, RecordBatch, StringBuilder,
};
use deltalake::arrow::datatypes::{DataType, Field, Schema};
use deltalake::arrow::error::ArrowError;
use serde_json::Value;
use std::sync::Arc;

use crate::record::RawRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Int64),
            Value::Number(_) => Some(ColumnType::Float64),
            _ => Some(ColumnType::Utf8),
        }
    }

    fn merge(self, other: Self) -> Self {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => Utf8,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }
}

/// Encode records as one record batch, leaving out the `exclude` columns.
pub fn encode(records: &[RawRecord], exclude: &[&str]) -> Result<RecordBatch, ArrowError> {
    let mut columns: Vec<(&str, Option<ColumnType>)> = Vec::new();
    for record in records {
        for (name, value) in record {
            if exclude.contains(&name.as_str()) {
                continue;
            }
            let seen = ColumnType::of(value);
            match columns.iter_mut().find(|(n, _)| *n == name.as_str()) {
                Some((_, current)) => {
                    *current = match (*current, seen) {
                        (Some(a), Some(b)) => Some(a.merge(b)),
                        (a, b) => a.or(b),
                    }
                }
                None => columns.push((name.as_str(), seen)),
            }
        }
    }

    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays = Vec::with_capacity(columns.len());
    for (name, column_type) in columns {
        let column_type = column_type.unwrap_or(ColumnType::Utf8);
        fields.push(Field::new(name, column_type.data_type(), true));
        arrays.push(build_array(records, name, column_type));
    }

    let schema = Arc::new(Schema::new(fields));
    if arrays.is_empty() {
        return RecordBatch::try_new_with_options(
            schema,
            arrays,
            &deltalake::arrow::array::RecordBatchOptions::new().with_row_count(Some(records.len())),
        );
    }
    RecordBatch::try_new(schema, arrays)
}

fn build_array(records: &[RawRecord], name: &str, column_type: ColumnType) -> ArrayRef {
    let values = records.iter().map(|r| r.get(name).filter(|v| !v.is_null()));
    match column_type {
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(records.len());
            values.for_each(|v| builder.append_option(v.and_then(Value::as_bool)));
            Arc::new(builder.finish())
        }
        ColumnType::Int64 => {
            let mut builder = Int64Builder::with_capacity(records.len());
            values.for_each(|v| builder.append_option(v.and_then(Value::as_i64)));
            Arc::new(builder.finish())
        }
        ColumnType::Float64 => {
            let mut builder = Float64Builder::with_capacity(records.len());
            values.for_each(|v| builder.append_option(v.and_then(Value::as_f64)));
            Arc::new(builder.finish())
        }
        ColumnType::Utf8 => {
            let mut builder = StringBuilder::new();
            values.for_each(|v| match v {
                Some(Value::String(s)) => builder.append_value(s),
                Some(other) => builder.append_value(other.to_string()),
                None => builder.append_null(),
            });
            Arc::new(builder.finish())
        }
    }
}
