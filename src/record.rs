//! Record batches flowing through the stages.

use serde_json::{Map, Value};

use crate::identifier::PartitionKey;

/// One record as fetched from the source: a JSON object.
pub type RawRecord = Map<String, Value>;

/// One row returned by a partition query.
pub type Row = Map<String, Value>;

/// Ordered records of one extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecordBatch {
    records: Vec<RawRecord>,
}

impl RawRecordBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    /// Interpret a JSON document as a batch.
    ///
    /// An array of objects is a batch; a lone object is a batch of one.
    /// Anything else is rejected with a description of what was found.
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| match item {
                    Value::Object(record) => Ok(record),
                    other => Err(format!(
                        "element {index} is {}, not an object",
                        describe(&other)
                    )),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::new),
            Value::Object(record) => Ok(Self::new(vec![record])),
            other => Err(format!("expected an array of objects, got {}", describe(&other))),
        }
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RawRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append another batch, keeping order.
    pub fn extend(&mut self, other: RawRecordBatch) {
        self.records.extend(other.records);
    }

    /// Serialize as the JSON array stored in the raw bucket.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.records)
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Raw records plus the derived columns, all belonging to one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecordBatch {
    partition: PartitionKey,
    records: Vec<RawRecord>,
}

impl EnrichedRecordBatch {
    pub(crate) fn new(partition: PartitionKey, records: Vec<RawRecord>) -> Self {
        Self { partition, records }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
