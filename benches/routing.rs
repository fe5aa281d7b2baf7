use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ruta::core::{PartitionKey, PartitionKeyRange, Range, ServerIdentity};
use ruta::routing::{CollectionRoutingMap, PartitionKeyRangeCache, RangeWithOwner, StaticMetadataSource};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Evenly spaced layout of `count` ranges over `["", "FF")`
fn create_layout(count: usize) -> Vec<RangeWithOwner> {
    let boundary = |i: usize| -> String {
        match i {
            0 => String::new(),
            i if i == count => "FF".to_string(),
            i => format!("{:04X}", i * 0xFF00 / count),
        }
    };

    (0..count)
        .map(|i| {
            (
                PartitionKeyRange::new(i.to_string(), boundary(i), boundary(i + 1)).unwrap(),
                ServerIdentity::new(format!("rs-{}", i)),
            )
        })
        .collect()
}

fn bench_routing_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_map");

    for range_count in [10, 100, 1000].iter() {
        let map = CollectionRoutingMap::try_create("bench", create_layout(*range_count), None).unwrap();
        let keys: Vec<String> = (0..256)
            .map(|i| PartitionKey::new(format!("customer-{}", i)).effective_partition_key())
            .collect();

        group.bench_with_input(
            BenchmarkId::new("range_by_effective_partition_key", range_count),
            &keys,
            |b, keys| {
                b.iter(|| {
                    for key in keys {
                        black_box(map.range_by_effective_partition_key(key).unwrap());
                    }
                });
            },
        );

        let query = Range::half_open("10".to_string(), "30".to_string()).unwrap();
        group.bench_with_input(
            BenchmarkId::new("overlapping_ranges", range_count),
            &query,
            |b, query| {
                b.iter(|| black_box(map.overlapping_ranges(query)));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("try_create", range_count),
            range_count,
            |b, &range_count| {
                b.iter(|| {
                    black_box(CollectionRoutingMap::try_create("bench", create_layout(range_count), None).unwrap())
                });
            },
        );
    }

    group.finish();
}

fn bench_effective_partition_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("effective_partition_key");

    group.bench_function("string_keys", |b| {
        let keys: Vec<PartitionKey> = (0..1000).map(|i| PartitionKey::new(format!("customer-{}", i))).collect();
        b.iter(|| {
            for key in &keys {
                black_box(key.effective_partition_key());
            }
        });
    });

    group.bench_function("number_keys", |b| {
        b.iter(|| {
            for i in 0..1000i64 {
                black_box(PartitionKey::new(i).effective_partition_key());
            }
        });
    });

    group.finish();
}

fn bench_cache_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("partition_key_range_cache");

    let source = StaticMetadataSource::new().with_collection("bench", create_layout(100));
    let cache = PartitionKeyRangeCache::new(Arc::new(source));
    rt.block_on(cache.try_lookup("bench")).unwrap();

    group.bench_function("try_lookup_cached", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.try_lookup("bench").await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_routing_map,
    bench_effective_partition_key,
    bench_cache_lookup
);

criterion_main!(benches);
