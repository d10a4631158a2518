//! Integration tests for avalanche

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use avalanche::identifier::PartitionKey;
use avalanche::record::{RawRecord, RawRecordBatch};

fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(record) => record,
        other => panic!("Expected a JSON object, got {other}"),
    }
}

fn banks(n: usize) -> RawRecordBatch {
    RawRecordBatch::new(
        (0..n)
            .map(|i| {
                record(json!({
                    "uid": format!("uid-{i}"),
                    "account_number": i,
                    "iban": "GB33BUKB20201555555555",
                    "bank_name": "BARCLAYS",
                    "routing_number": "021000021",
                    "swift_bic": "BUKBGB22",
                }))
            })
            .collect(),
    )
}

fn key(value: &str) -> PartitionKey {
    PartitionKey::parse(value).unwrap()
}

mod config_tests {
    use avalanche::config::{LauncherKind, Settings, StageCommand};
    use avalanche::stage::{StageKind, StageTable, Variant};

    #[test]
    fn test_settings_file_with_defaults_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avalanche.yaml");
        std::fs::write(
            &path,
            r#"
launcher: ${AVALANCHE_TEST_UNSET_LAUNCHER:-process}
transform:
  workers: ${AVALANCHE_TEST_UNSET_WORKERS:-6}
query:
  select_columns: [composite_pk, country_code]
stages:
  - name: dispatch
    stage: dispatch
    job_name: banks-dispatch
    default_arguments:
      limit_rows: "50"
"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.launcher, LauncherKind::Process);
        assert_eq!(settings.transform.workers, 6);
        assert_eq!(settings.query.select_columns, vec!["composite_pk", "country_code"]);

        let table = StageTable::default().with_overrides(&settings.stages);
        let dispatch = table.resolve("dispatch", Variant::Standard).unwrap();
        assert_eq!(dispatch.job_name, "banks-dispatch");
        assert_eq!(dispatch.kind, StageKind::Dispatch);
        assert_eq!(dispatch.default_arguments["limit_rows"], "50");

        // Entries not overridden keep their defaults.
        let spark = table.resolve("process", Variant::Scaled).unwrap();
        assert_eq!(spark.job_name, "process-spark");
    }

    #[test]
    fn test_unset_variable_fails() {
        let err = Settings::from_yaml("launcher: local\n").map(|_| ());
        assert!(err.is_ok());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avalanche.yaml");
        std::fs::write(&path, "storage_options:\n  aws_secret_access_key: ${AVALANCHE_TEST_UNSET_SECRET}\n")
            .unwrap();
        assert!(Settings::from_file(&path).is_err());
    }

    #[test]
    fn test_unknown_stage_name() {
        let err = StageTable::default()
            .resolve("publish", Variant::Standard)
            .unwrap_err();
        assert!(err.to_string().contains("publish"));
    }

    #[test]
    fn test_glue_style_arguments() {
        let arguments: std::collections::HashMap<String, String> = [
            ("s3_bucket_processed", "banks-processed"),
            ("table_partition", "01-01-2024T10:00:00"),
            ("glue_database", "banks"),
            ("glue_table", "accounts"),
            ("limit_rows", "10"),
            ("endpoint", "https://example.com/banks"),
            ("DRYRUN", "TRUE"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let command = StageCommand::from_arguments("dispatch", &arguments).unwrap();
        assert_eq!(command.kind(), StageKind::Dispatch);
        assert!(command.run_args().dry_run);
        assert!(command.run_args().pipeline_run_id.is_none());

        let mut bad = arguments.clone();
        bad.insert("DRYRUN".to_string(), "yes".to_string());
        assert!(StageCommand::from_arguments("dispatch", &bad).is_err());
    }
}

mod storage_tests {
    use avalanche::storage::{BackendConfig, bucket_url, join_url};

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://banks-processed/banks/accounts").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "banks-processed");
                assert_eq!(s3.key.unwrap().to_string(), "banks/accounts");
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        for url in ["/local/path/to/data", "file:///local/path/to/data/"] {
            match BackendConfig::parse_url(url).unwrap() {
                BackendConfig::Local(local) => {
                    assert_eq!(local.path, "/local/path/to/data");
                }
                _ => panic!("Expected Local config"),
            }
        }
    }

    #[test]
    fn test_invalid_url() {
        assert!(BackendConfig::parse_url("gs://bucket/path").is_err());
        assert!(BackendConfig::parse_url("relative/path").is_err());
    }

    #[test]
    fn test_bucket_names_become_urls() {
        assert_eq!(bucket_url("banks-raw"), "s3://banks-raw");
        assert_eq!(bucket_url("s3://banks-raw/"), "s3://banks-raw");
        assert_eq!(bucket_url("/tmp/raw"), "/tmp/raw");
        assert_eq!(
            join_url(&bucket_url("banks-processed"), "banks/accounts"),
            "s3://banks-processed/banks/accounts"
        );
    }
}

mod identifier_tests {
    use super::*;
    use avalanche::identifier::{ObjectIdentifier, derive_partition_key};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_minted_identifier_round_trips_to_its_partition() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        let id = ObjectIdentifier::mint(at);
        assert_eq!(id.as_str(), "raw_files/banks_data_07-03-2024T09:05:01.json");
        assert_eq!(derive_partition_key(&id).unwrap(), key("07-03-2024T09:05:01"));
    }

    #[test]
    fn test_malformed_identifiers() {
        for id in ["raw_files/banks.json", "no-separator", "raw_files/banks_data_.json"] {
            assert!(
                derive_partition_key(&ObjectIdentifier::new(id)).is_err(),
                "{id} should be rejected"
            );
        }
    }
}

mod transform_tests {
    use super::*;
    use avalanche::transform::{enrich, enrich_scaled};

    #[tokio::test]
    async fn test_scaled_matches_standard() {
        let batch = banks(257);
        let partition = key("01-01-2024T10:00:00");

        let standard = enrich(&batch, &partition).unwrap();
        for workers in [1, 4, 300] {
            let scaled = enrich_scaled(batch.clone(), &partition, workers).await.unwrap();
            assert_eq!(scaled.records(), standard.records());
        }

        let first = &standard.records()[0];
        assert_eq!(first["composite_pk"], json!("0-GB33BUKB20201555555555"));
        assert_eq!(first["country_code"], json!("GB"));
        assert_eq!(first["extraction_datetime"], json!("01-01-2024T10:00:00"));
        assert_eq!(first["account_number"], json!(0));
    }

    #[tokio::test]
    async fn test_scaled_reports_first_invalid_record() {
        let mut records = banks(100).into_records();
        records[42].remove("iban");
        records[77].remove("swift_bic");
        let batch = RawRecordBatch::new(records);
        let partition = key("01-01-2024T10:00:00");

        let standard = enrich(&batch, &partition).unwrap_err().to_string();
        let scaled = enrich_scaled(batch, &partition, 8)
            .await
            .unwrap_err()
            .to_string();
        assert_eq!(standard, scaled);
        assert!(standard.contains("record 42"), "{standard}");
    }
}

mod parquet_tests {
    use super::*;
    use avalanche::config::{ParquetCompression, ParquetSettings};
    use avalanche::sink::encode::encode;
    use avalanche::sink::parquet::{ParquetWriter, ParquetWriterConfig};
    use avalanche::transform::enrich;

    #[test]
    fn test_enriched_batch_written_under_partition_directory() {
        let partition = key("01-01-2024T10:00:00");
        let enriched = enrich(&banks(100), &partition).unwrap();
        let batch = encode(enriched.records(), &["extraction_datetime"]).unwrap();
        assert_eq!(batch.num_rows(), 100);
        assert!(batch.schema().field_with_name("extraction_datetime").is_err());

        let mut writer =
            ParquetWriter::new(batch.schema(), ParquetWriterConfig::default(), partition.directory())
                .unwrap();
        writer.write_batch(&batch).unwrap();
        assert!(writer.current_file_size() > 0);

        let files = writer.close().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].record_count, 100);
        assert!(files[0].filename.starts_with(&partition.directory()));
        assert!(files[0].filename.ends_with(".parquet"));
        assert_eq!(files[0].size, files[0].bytes.len());
    }

    #[test]
    fn test_writer_config_from_settings() {
        let config = ParquetWriterConfig::from(&ParquetSettings {
            compression: ParquetCompression::Zstd,
            file_size_mb: 64,
        });
        assert_eq!(config.target_file_size, 64 * 1024 * 1024);
        assert_eq!(config.compression, ParquetCompression::Zstd);
    }
}

mod catalog_tests {
    use super::*;
    use avalanche::error::CatalogError;
    use avalanche::identifier::CatalogCoords;
    use avalanche::record::Row;
    use avalanche::query::PartitionQuery;
    use avalanche::sink::DeltaCatalog;
    use avalanche::sink::parquet::ParquetWriterConfig;
    use avalanche::storage::StorageProvider;
    use avalanche::transform::enrich;
    use deltalake::arrow::datatypes::DataType;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> DeltaCatalog {
        let url = dir.path().join("banks/accounts").display().to_string();
        let storage = StorageProvider::for_url_with_options(&url, HashMap::new())
            .await
            .unwrap();
        DeltaCatalog::open(Arc::new(storage), ParquetWriterConfig::default())
            .await
            .unwrap()
    }

    async fn count(catalog: &DeltaCatalog, partition: &str) -> usize {
        PartitionQuery::new(
            CatalogCoords::new("banks", "accounts").unwrap(),
            key(partition),
            usize::MAX,
            &["uid".to_string()],
        )
        .unwrap()
        .execute(catalog)
        .await
        .unwrap()
        .len()
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let partition = key("01-01-2024T10:00:00");
        let enriched = enrich(&banks(25), &partition).unwrap();

        let mut catalog = open(&dir).await;
        assert!(!catalog.exists());
        let first = catalog.overwrite_partition(&enriched).await.unwrap().unwrap();
        let second = catalog.overwrite_partition(&enriched).await.unwrap().unwrap();

        assert_eq!(first.files_removed, 0);
        assert_eq!(second.files_removed, first.files_added);
        assert!(second.version > first.version);
        assert_eq!(count(&catalog, partition.as_str()).await, 25);

        // A fresh handle sees the same state.
        let reopened = open(&dir).await;
        assert_eq!(reopened.version(), Some(second.version));
        assert_eq!(reopened.partition_files(&partition).await.unwrap().len(), second.files_added);
        assert_eq!(count(&reopened, partition.as_str()).await, 25);
    }

    #[tokio::test]
    async fn test_other_partitions_untouched() {
        let dir = TempDir::new().unwrap();
        let monday = key("01-01-2024T10:00:00");
        let tuesday = key("02-01-2024T10:00:00");

        let mut catalog = open(&dir).await;
        catalog
            .overwrite_partition(&enrich(&banks(10), &monday).unwrap())
            .await
            .unwrap();
        catalog
            .overwrite_partition(&enrich(&banks(4), &tuesday).unwrap())
            .await
            .unwrap();
        let monday_files = catalog.partition_files(&monday).await.unwrap();

        catalog
            .overwrite_partition(&enrich(&banks(2), &tuesday).unwrap())
            .await
            .unwrap();

        let after = catalog.partition_files(&monday).await.unwrap();
        assert_eq!(after, monday_files);
        assert_eq!(count(&catalog, monday.as_str()).await, 10);
        assert_eq!(count(&catalog, tuesday.as_str()).await, 2);
    }

    #[tokio::test]
    async fn test_keys_differing_only_by_colons_stay_apart() {
        let dir = TempDir::new().unwrap();
        let colons = key("01-01-2024T10:00:00");
        let bare = key("01-01-2024T100000");
        assert_ne!(colons.directory(), bare.directory());

        let mut catalog = open(&dir).await;
        catalog
            .overwrite_partition(&enrich(&banks(5), &colons).unwrap())
            .await
            .unwrap();
        let commit = catalog
            .overwrite_partition(&enrich(&banks(2), &bare).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.files_removed, 0);

        assert_eq!(count(&catalog, colons.as_str()).await, 5);
        assert_eq!(count(&catalog, bare.as_str()).await, 2);

        let colon_files = catalog.partition_files(&colons).await.unwrap();
        let bare_files = catalog.partition_files(&bare).await.unwrap();
        assert!(colon_files.iter().all(|f| !bare_files.contains(f)));

        // Overwriting one again leaves the other alone.
        catalog
            .overwrite_partition(&enrich(&banks(3), &bare).unwrap())
            .await
            .unwrap();
        assert_eq!(catalog.partition_files(&colons).await.unwrap(), colon_files);
        assert_eq!(count(&catalog, colons.as_str()).await, 5);
        assert_eq!(count(&catalog, bare.as_str()).await, 3);
    }

    fn text_banks(n: usize) -> RawRecordBatch {
        RawRecordBatch::new(
            (0..n)
                .map(|i| {
                    record(json!({
                        "uid": format!("uid-{i}"),
                        "account_number": format!("{i:010}"),
                        "iban": "GB33BUKB20201555555555",
                        "bank_name": "BARCLAYS",
                        "routing_number": "021000021",
                        "swift_bic": "BUKBGB22",
                    }))
                })
                .collect(),
        )
    }

    async fn select(catalog: &DeltaCatalog, partition: &str, columns: &[&str]) -> Vec<Row> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        PartitionQuery::new(
            CatalogCoords::new("banks", "accounts").unwrap(),
            key(partition),
            usize::MAX,
            &columns,
        )
        .unwrap()
        .execute(catalog)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_later_batches_merge_into_table_schema() {
        let dir = TempDir::new().unwrap();
        let monday = key("01-01-2024T10:00:00");
        let tuesday = key("02-01-2024T10:00:00");

        let mut catalog = open(&dir).await;
        catalog
            .overwrite_partition(&enrich(&text_banks(3), &monday).unwrap())
            .await
            .unwrap();

        let drifted = RawRecordBatch::new(
            (0..2)
                .map(|i| {
                    record(json!({
                        "uid": 100 + i,
                        "account_number": 7000 + i,
                        "iban": "GB33BUKB20201555555555",
                        "bank_name": "BARCLAYS",
                        "routing_number": "021000021",
                        "swift_bic": "BUKBGB22",
                        "branch": "north",
                    }))
                })
                .collect(),
        );
        catalog
            .overwrite_partition(&enrich(&drifted, &tuesday).unwrap())
            .await
            .unwrap();

        for catalog in [&catalog, &open(&dir).await] {
            let schema = catalog.data_schema().unwrap();
            assert_eq!(
                schema.field_with_name("uid").unwrap().data_type(),
                &DataType::Utf8
            );
            assert_eq!(
                schema.field_with_name("account_number").unwrap().data_type(),
                &DataType::Utf8
            );
            assert_eq!(
                schema.field_with_name("branch").unwrap().data_type(),
                &DataType::Utf8
            );
        }

        let rows = select(&catalog, tuesday.as_str(), &["uid", "account_number", "branch"]).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["uid"], json!("100"));
        assert_eq!(rows[0]["account_number"], json!("7000"));
        assert_eq!(rows[0]["branch"], json!("north"));

        // Written before the column existed.
        let rows = select(&catalog, monday.as_str(), &["uid", "branch"]).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["uid"], json!("uid-0"));
        assert_eq!(rows[0]["branch"], Value::Null);
    }

    #[tokio::test]
    async fn test_uncastable_batch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let monday = key("01-01-2024T10:00:00");
        let tuesday = key("02-01-2024T10:00:00");

        let mut catalog = open(&dir).await;
        // account_number is an integer column here.
        catalog
            .overwrite_partition(&enrich(&banks(4), &monday).unwrap())
            .await
            .unwrap();
        let version = catalog.version();

        let err = catalog
            .overwrite_partition(&enrich(&text_banks(2), &tuesday).unwrap())
            .await
            .unwrap_err();
        assert!(
            matches!(err, CatalogError::SchemaMismatch { ref column, .. } if column == "account_number"),
            "{err}"
        );
        assert_eq!(catalog.version(), version);
        assert_eq!(count(&catalog, monday.as_str()).await, 4);
        assert_eq!(count(&catalog, tuesday.as_str()).await, 0);
    }

    #[tokio::test]
    async fn test_empty_batch_commits_nothing() {
        let dir = TempDir::new().unwrap();
        let partition = key("01-01-2024T10:00:00");
        let mut catalog = open(&dir).await;

        let empty = enrich(&RawRecordBatch::default(), &partition).unwrap();
        assert!(catalog.overwrite_partition(&empty).await.unwrap().is_none());
        assert!(!catalog.exists());
    }
}
