//! Identifiers passed between stages.
//!
//! A raw batch is addressed by its object key, which embeds the extraction
//! timestamp (`raw_files/banks_data_01-01-2024T10:00:00.json`). The
//! timestamp becomes the partition key of the enriched batch, and the
//! partition key plus the catalog coordinates address it downstream.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use snafu::prelude::*;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{
    ConfigError, IdentifierError, InvalidIdentifierSnafu, MalformedIdentifierSnafu,
};

/// Directory raw batches are written under.
pub const RAW_PREFIX: &str = "raw_files";

/// Format of the extraction timestamp embedded in object keys.
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%YT%H:%M:%S";

/// Partition column of every catalog table.
pub const PARTITION_COLUMN: &str = "extraction_datetime";

const JSON_SUFFIX: &str = ".json";

/// File name stem of every raw batch, whatever dataset was fetched.
const RAW_STEM: &str = "banks_data_";

static CATALOG_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier pattern"));

/// Key of a raw batch, relative to the raw bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier(String);

impl ObjectIdentifier {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for a batch extracted at `at`.
    pub fn mint(at: DateTime<Utc>) -> Self {
        Self(format!(
            "{RAW_PREFIX}/{RAW_STEM}{}{JSON_SUFFIX}",
            at.format(TIMESTAMP_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of the partition column for one extraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Validate a partition key received as an argument.
    pub fn parse(value: &str) -> Result<Self, IdentifierError> {
        ensure!(
            !value.is_empty(),
            MalformedIdentifierSnafu {
                identifier: value,
                reason: "partition key is empty",
            }
        );
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '-')))
        {
            return MalformedIdentifierSnafu {
                identifier: value,
                reason: format!("unexpected character '{bad}' in partition key"),
            }
            .fail();
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory-safe form of the key. `:` becomes `_`, which a key never
    /// contains, so distinct keys never share a directory.
    pub fn path_segment(&self) -> String {
        self.0.replace(':', "_")
    }

    /// Hive-style directory holding the partition, relative to the table root.
    pub fn directory(&self) -> String {
        format!("{PARTITION_COLUMN}={}", self.path_segment())
    }

    /// The extraction time, when the key uses the timestamp format.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.0, TIMESTAMP_FORMAT).ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the partition key embedded in an object key.
///
/// The key is the token after the last `_`, without the `.json` suffix.
pub fn derive_partition_key(object_id: &ObjectIdentifier) -> Result<PartitionKey, IdentifierError> {
    let key = object_id.as_str();
    let Some((_, token)) = key.rsplit_once('_') else {
        return MalformedIdentifierSnafu {
            identifier: key,
            reason: "no '_' separator",
        }
        .fail();
    };
    let token = token.strip_suffix(JSON_SUFFIX).unwrap_or(token);
    ensure!(
        !token.contains('/'),
        MalformedIdentifierSnafu {
            identifier: key,
            reason: "last '_' is not in the file name",
        }
    );

    PartitionKey::parse(token).map_err(|_| {
        MalformedIdentifierSnafu {
            identifier: key,
            reason: format!("'{token}' is not a partition key"),
        }
        .build()
    })
}

/// Accept only plain `[A-Za-z_][A-Za-z0-9_]*` names, safe to quote in SQL.
pub fn validate_sql_identifier(identifier: &str) -> Result<(), ConfigError> {
    ensure!(
        CATALOG_IDENTIFIER.is_match(identifier),
        InvalidIdentifierSnafu { identifier }
    );
    Ok(())
}

/// Database and table naming a catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogCoords {
    pub database: String,
    pub table: String,
}

impl CatalogCoords {
    /// Validate both names as plain SQL identifiers.
    pub fn new(database: &str, table: &str) -> Result<Self, ConfigError> {
        validate_sql_identifier(database)?;
        validate_sql_identifier(table)?;
        Ok(Self {
            database: database.to_string(),
            table: table.to_string(),
        })
    }

    /// Table root relative to the processed bucket.
    pub fn table_path(&self) -> String {
        format!("{}/{}", self.database, self.table)
    }

    /// Quoted `"database"."table"` reference.
    pub fn quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.database, self.table)
    }
}

impl fmt::Display for CatalogCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn derive(key: &str) -> Result<PartitionKey, IdentifierError> {
        derive_partition_key(&ObjectIdentifier::new(key))
    }

    #[test]
    fn test_derive_partition_key() {
        let key = derive("raw_files/banks_data_01-01-2024T10:00:00.json").unwrap();
        assert_eq!(key.as_str(), "01-01-2024T10:00:00");
        assert_eq!(key.path_segment(), "01-01-2024T10_00_00");
        assert_eq!(key.directory(), "extraction_datetime=01-01-2024T10_00_00");
    }

    #[test]
    fn test_derive_without_suffix() {
        let key = derive("raw_files/banks_data_01-01-2024T10:00:00").unwrap();
        assert_eq!(key.as_str(), "01-01-2024T10:00:00");
    }

    #[test]
    fn test_malformed_identifiers() {
        for key in [
            "raw_files/nounderscore.json",
            "raw_files/banks_data_.json",
            "raw_files/banks_data/part-0.json",
            "raw_files/banks_data_01 01 2024.json",
        ] {
            let err = derive(key).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn test_mint_round_trips_through_derive() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let object_id = ObjectIdentifier::mint(at);
        assert_eq!(
            object_id.as_str(),
            "raw_files/banks_data_01-01-2024T10:00:00.json"
        );

        let key = derive_partition_key(&object_id).unwrap();
        assert_eq!(key.timestamp(), Some(at.naive_utc()));
    }

    #[test]
    fn test_partition_key_parse() {
        assert!(PartitionKey::parse("01-01-2024T10:00:00").is_ok());
        assert!(PartitionKey::parse("").is_err());
        assert!(PartitionKey::parse("x/../y").is_err());
        assert!(PartitionKey::parse("2024'; DROP").is_err());
        assert_eq!(PartitionKey::parse("batch-7").unwrap().timestamp(), None);
    }

    #[test]
    fn test_path_segments_are_distinct() {
        let colons = PartitionKey::parse("01-01-2024T10:00:00").unwrap();
        let bare = PartitionKey::parse("01-01-2024T100000").unwrap();
        assert_ne!(colons.directory(), bare.directory());
        assert_eq!(bare.path_segment(), "01-01-2024T100000");
    }

    #[test]
    fn test_catalog_coords() {
        let coords = CatalogCoords::new("banks", "accounts_v2").unwrap();
        assert_eq!(coords.table_path(), "banks/accounts_v2");
        assert_eq!(coords.quoted(), "\"banks\".\"accounts_v2\"");

        assert!(CatalogCoords::new("banks", "accounts; drop").is_err());
        assert!(CatalogCoords::new("1banks", "accounts").is_err());
        assert!(CatalogCoords::new("", "accounts").is_err());
    }
}
