//! avalanche benchmark suite.
//!
//! - Enrichment throughput, standard vs scaled
//! - Shard decoding, sequential vs on blocking workers
//! - Encoding enriched records to Parquet

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

use avalanche::identifier::PartitionKey;
use avalanche::record::{RawRecord, RawRecordBatch};
use avalanche::sink::encode::encode;
use avalanche::sink::parquet::{ParquetWriter, ParquetWriterConfig};
use avalanche::source::shards::decode_shard;
use avalanche::transform::{enrich, enrich_scaled};

const SWIFT_CODES: [&str; 4] = ["DEUTDEFF500", "BUKBGB22", "ABNANL2A", "BNPAFRPP"];

/// Deterministic bank records.
fn generate_records(count: usize) -> RawRecordBatch {
    RawRecordBatch::new(
        (0..count)
            .map(|i| {
                let serde_json::Value::Object(record) = json!({
                    "id": i,
                    "uid": format!("uid-{i:08}"),
                    "account_number": format!("{:010}", i * 7919),
                    "iban": format!("GB{:02}BUKB{:014}", i % 97, i),
                    "bank_name": "BARCLAYS",
                    "routing_number": "021000021",
                    "swift_bic": SWIFT_CODES[i % SWIFT_CODES.len()],
                }) else {
                    unreachable!()
                };
                record
            })
            .collect(),
    )
}

fn partition() -> PartitionKey {
    PartitionKey::parse("01-01-2024T10:00:00").unwrap()
}

fn enrich_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("enrich");
    let key = partition();

    for size in [1_000, 10_000, 100_000] {
        let batch = generate_records(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("standard", size), &batch, |b, batch| {
            b.iter(|| enrich(batch, &key).unwrap());
        });

        for workers in [2, 8] {
            group.bench_with_input(
                BenchmarkId::new(format!("scaled_{workers}"), size),
                &batch,
                |b, batch| {
                    b.to_async(&rt).iter(|| {
                        let batch = batch.clone();
                        let key = key.clone();
                        async move { enrich_scaled(batch, &key, workers).await.unwrap() }
                    });
                },
            );
        }
    }

    group.finish();
}

/// Sequential decoding against `spawn_blocking` fan-out, as the scaled
/// process variant reads shards.
fn shard_decoding_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("shard_decoding");

    let num_shards = 8;
    let records_per_shard = 20_000;
    let shards: Vec<(String, Vec<u8>)> = (0..num_shards)
        .map(|i| {
            let records: Vec<RawRecord> = generate_records(records_per_shard).into_records();
            let lines: Vec<String> = records
                .iter()
                .map(|r| serde_json::Value::Object(r.clone()).to_string())
                .collect();
            (format!("part-{i}.json"), lines.join("\n").into_bytes())
        })
        .collect();
    group.throughput(Throughput::Elements((num_shards * records_per_shard) as u64));

    group.bench_function("sequential", |b| {
        b.iter(|| {
            shards
                .iter()
                .map(|(path, bytes)| decode_shard(path, bytes).unwrap().len())
                .sum::<usize>()
        });
    });

    group.bench_function("parallel_spawn_blocking", |b| {
        b.to_async(&rt).iter(|| {
            let shards = shards.clone();
            async move {
                use futures::stream::{FuturesUnordered, StreamExt};

                let mut tasks: FuturesUnordered<_> = shards
                    .into_iter()
                    .map(|(path, bytes)| {
                        tokio::task::spawn_blocking(move || decode_shard(&path, &bytes).unwrap().len())
                    })
                    .collect();

                let mut total = 0;
                while let Some(count) = tasks.next().await {
                    total += count.unwrap();
                }
                total
            }
        });
    });

    group.finish();
}

fn parquet_writing_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("parquet_writing");
    let key = partition();

    for size in [1_000, 10_000] {
        let enriched = enrich(&generate_records(size), &key).unwrap();
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_and_write", size), &enriched, |b, enriched| {
            b.iter(|| {
                let batch = encode(enriched.records(), &["extraction_datetime"]).unwrap();
                let mut writer =
                    ParquetWriter::new(batch.schema(), ParquetWriterConfig::default(), key.directory())
                        .unwrap();
                writer.write_batch(&batch).unwrap();
                writer.close().unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    enrich_benchmarks,
    shard_decoding_benchmarks,
    parquet_writing_benchmarks
);
criterion_main!(benches);
