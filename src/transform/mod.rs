//! Derived-column transform shared by both process variants.
//!
//! Every raw record gains three columns:
//!
//! - `extraction_datetime`: the partition key of the batch
//! - `composite_pk`: `account_number` and `iban` joined with `-`
//! - `country_code`: characters `[4, 6)` of `swift_bic`
//!
//! Source fields are never modified and no record is dropped. The scaled
//! variant in [`scaled`] produces identical output, including which record
//! is reported when the input is invalid.

pub mod scaled;

use serde_json::Value;
use snafu::prelude::*;

use crate::error::{SchemaViolationSnafu, TransformError};
use crate::identifier::{PARTITION_COLUMN, PartitionKey};
use crate::record::{EnrichedRecordBatch, RawRecord, RawRecordBatch};

pub use scaled::enrich_scaled;

pub const EXTRACTION_DATETIME: &str = PARTITION_COLUMN;
pub const COMPOSITE_PK: &str = "composite_pk";
pub const COUNTRY_CODE: &str = "country_code";

const ACCOUNT_NUMBER: &str = "account_number";
const IBAN: &str = "iban";
const SWIFT_BIC: &str = "swift_bic";

const PK_SEPARATOR: &str = "-";
const COUNTRY_CODE_RANGE: std::ops::Range<usize> = 4..6;

/// Enrich a batch on the calling thread.
pub fn enrich(
    batch: &RawRecordBatch,
    extraction_datetime: &PartitionKey,
) -> Result<EnrichedRecordBatch, TransformError> {
    let records = enrich_records(batch.records(), 0, extraction_datetime)?;
    Ok(EnrichedRecordBatch::new(extraction_datetime.clone(), records))
}

/// Enrich a run of records whose first element has batch index `offset`.
pub(crate) fn enrich_records(
    records: &[RawRecord],
    offset: usize,
    extraction_datetime: &PartitionKey,
) -> Result<Vec<RawRecord>, TransformError> {
    records
        .iter()
        .enumerate()
        .map(|(i, record)| enrich_record(offset + i, record, extraction_datetime))
        .collect()
}

fn enrich_record(
    index: usize,
    record: &RawRecord,
    extraction_datetime: &PartitionKey,
) -> Result<RawRecord, TransformError> {
    for derived in [EXTRACTION_DATETIME, COMPOSITE_PK, COUNTRY_CODE] {
        ensure!(
            !record.contains_key(derived),
            SchemaViolationSnafu {
                index,
                message: format!("field '{derived}' is reserved for a derived column"),
            }
        );
    }

    let account_number = text_field(index, record, ACCOUNT_NUMBER)?;
    let iban = text_field(index, record, IBAN)?;
    let swift_bic = text_field(index, record, SWIFT_BIC)?;

    let country_code: String = swift_bic
        .chars()
        .skip(COUNTRY_CODE_RANGE.start)
        .take(COUNTRY_CODE_RANGE.len())
        .collect();
    ensure!(
        country_code.chars().count() == COUNTRY_CODE_RANGE.len(),
        SchemaViolationSnafu {
            index,
            message: format!(
                "field '{SWIFT_BIC}' must have at least {} characters, got '{swift_bic}'",
                COUNTRY_CODE_RANGE.end
            ),
        }
    );

    let mut enriched = record.clone();
    enriched.insert(
        EXTRACTION_DATETIME.to_string(),
        Value::String(extraction_datetime.as_str().to_string()),
    );
    enriched.insert(
        COMPOSITE_PK.to_string(),
        Value::String(format!("{account_number}{PK_SEPARATOR}{iban}")),
    );
    enriched.insert(COUNTRY_CODE.to_string(), Value::String(country_code));
    Ok(enriched)
}

/// Read a required field as text. Strings are taken verbatim, numbers and
/// booleans as their JSON text.
fn text_field(index: usize, record: &RawRecord, name: &str) -> Result<String, TransformError> {
    match record.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(value @ (Value::Number(_) | Value::Bool(_))) => Ok(value.to_string()),
        Some(Value::Null) | None => SchemaViolationSnafu {
            index,
            message: format!("missing field '{name}'"),
        }
        .fail(),
        Some(_) => SchemaViolationSnafu {
            index,
            message: format!("field '{name}' must be a string, number, or boolean"),
        }
        .fail(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn bank(account_number: Value, iban: &str, swift_bic: &str) -> RawRecord {
        let Value::Object(record) = json!({
            "uid": "7d3c5c0e",
            "account_number": account_number,
            "iban": iban,
            "bank_name": "ABN AMRO",
            "routing_number": "011000015",
            "swift_bic": swift_bic,
        }) else {
            unreachable!()
        };
        record
    }

    fn key() -> PartitionKey {
        PartitionKey::parse("01-01-2024T10:00:00").unwrap()
    }

    #[test]
    fn test_enrich_derives_columns() {
        let batch = RawRecordBatch::new(vec![bank(json!("123"), "DE89...", "DEUTDEFF500")]);
        let enriched = enrich(&batch, &key()).unwrap();

        let record = &enriched.records()[0];
        assert_eq!(record[COMPOSITE_PK], json!("123-DE89..."));
        assert_eq!(record[COUNTRY_CODE], json!("DE"));
        assert_eq!(record[EXTRACTION_DATETIME], json!("01-01-2024T10:00:00"));
        assert_eq!(enriched.partition(), &key());
    }

    #[test]
    fn test_source_fields_untouched() {
        let raw = bank(json!("123"), "GB33BUKB20201555555555", "BUKBGB22XXX");
        let batch = RawRecordBatch::new(vec![raw.clone()]);
        let enriched = enrich(&batch, &key()).unwrap();

        let record = &enriched.records()[0];
        for (name, value) in &raw {
            assert_eq!(&record[name], value);
        }
        assert_eq!(record.len(), raw.len() + 3);
    }

    #[test]
    fn test_numeric_account_number_is_coerced() {
        let batch = RawRecordBatch::new(vec![bank(json!(123456), "NL91ABNA0417164300", "ABNANL2A")]);
        let enriched = enrich(&batch, &key()).unwrap();
        assert_eq!(
            enriched.records()[0][COMPOSITE_PK],
            json!("123456-NL91ABNA0417164300")
        );
        assert_eq!(enriched.records()[0][COUNTRY_CODE], json!("NL"));
    }

    #[test]
    fn test_missing_field_reports_first_index() {
        let mut broken = bank(json!("2"), "x", "DEUTDEFF");
        broken.remove(IBAN);
        let mut null_field = bank(json!("3"), "x", "DEUTDEFF");
        null_field.insert(SWIFT_BIC.to_string(), Value::Null);

        let batch = RawRecordBatch::new(vec![bank(json!("1"), "x", "DEUTDEFF"), broken, null_field]);
        match enrich(&batch, &key()).unwrap_err() {
            TransformError::SchemaViolation { index, message } => {
                assert_eq!(index, 1);
                assert!(message.contains("iban"));
            }
            other => panic!("Expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn test_short_swift_bic() {
        let batch = RawRecordBatch::new(vec![bank(json!("1"), "x", "DEUT")]);
        let err = enrich(&batch, &key()).unwrap_err();
        assert!(err.to_string().contains("swift_bic"));
    }

    #[test]
    fn test_country_code_counts_characters() {
        let batch = RawRecordBatch::new(vec![bank(json!("1"), "x", "ÄBCDÉFGH")]);
        let enriched = enrich(&batch, &key()).unwrap();
        assert_eq!(enriched.records()[0][COUNTRY_CODE], json!("ÉF"));
    }

    #[test]
    fn test_reserved_column_rejected() {
        let mut record = bank(json!("1"), "x", "DEUTDEFF");
        record.insert(COUNTRY_CODE.to_string(), json!("XX"));
        let err = enrich(&RawRecordBatch::new(vec![record]), &key()).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_nested_value_rejected() {
        let mut record = bank(json!("1"), "x", "DEUTDEFF");
        record.insert(IBAN.to_string(), json!({"value": "x"}));
        assert!(enrich(&RawRecordBatch::new(vec![record]), &key()).is_err());
    }

    #[test]
    fn test_enrich_is_deterministic() {
        let batch = RawRecordBatch::new(
            (0..50)
                .map(|i| bank(json!(i), "DE89370400440532013000", "DEUTDEFF500"))
                .collect(),
        );
        assert_eq!(enrich(&batch, &key()).unwrap(), enrich(&batch, &key()).unwrap());
    }

    #[test]
    fn test_empty_batch() {
        let enriched = enrich(&RawRecordBatch::default(), &key()).unwrap();
        assert!(enriched.is_empty());
    }
}
