//! Criterion benchmarks for the migration core's hot path.
//!
//! Run with: `cargo bench`
//!
//! Measures the XBZRLE cache (insert/get under LRU churn) and the codec
//! (encode/decode of a page delta), the two components the repository's
//! size budget weights heaviest.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use migrate_core::cache::PageCache;
use migrate_core::codec::{xbzrle_decode, xbzrle_encode, XbzrleEncodeResult};
use migrate_core::PAGE_SIZE;

fn sparse_delta_page(old: &[u8], changed_bytes: usize) -> Vec<u8> {
    let mut new = old.to_vec();
    for i in 0..changed_bytes {
        new[i * (PAGE_SIZE / changed_bytes.max(1))] ^= 0xFF;
    }
    new
}

fn bench_cache_insert_under_eviction_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_insert");
    let page = vec![0xAB; PAGE_SIZE];

    for capacity in [64usize, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &cap| {
            b.iter(|| {
                let mut cache = PageCache::init(cap, PAGE_SIZE).unwrap();
                for key in 0..(cap as u64 * 2) {
                    cache.insert(key, &page);
                }
                black_box(cache.len())
            });
        });
    }
    group.finish();
}

fn bench_cache_get_hit(c: &mut Criterion) {
    let page = vec![0xAB; PAGE_SIZE];
    let mut cache = PageCache::init(1024, PAGE_SIZE).unwrap();
    for key in 0..1024 {
        cache.insert(key, &page);
    }
    c.bench_function("cache_get_hit", |b| {
        b.iter(|| black_box(cache.get(black_box(512)).unwrap()[0]));
    });
}

fn bench_xbzrle_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("xbzrle_encode");
    let old = vec![0u8; PAGE_SIZE];

    for changed_bytes in [8usize, 128, 1024] {
        let new = sparse_delta_page(&old, changed_bytes);
        group.bench_with_input(
            BenchmarkId::from_parameter(changed_bytes),
            &changed_bytes,
            |b, _| {
                b.iter(|| match xbzrle_encode(black_box(&old), black_box(&new), PAGE_SIZE) {
                    XbzrleEncodeResult::Encoded(bytes) => black_box(bytes.len()),
                    _ => 0,
                });
            },
        );
    }
    group.finish();
}

fn bench_xbzrle_decode(c: &mut Criterion) {
    let old = vec![0u8; PAGE_SIZE];
    let new = sparse_delta_page(&old, 128);
    let encoded = match xbzrle_encode(&old, &new, PAGE_SIZE) {
        XbzrleEncodeResult::Encoded(bytes) => bytes,
        _ => panic!("expected an encoded delta for this fixture"),
    };

    c.bench_function("xbzrle_decode", |b| {
        b.iter(|| {
            let mut dest = old.clone();
            xbzrle_decode(black_box(&encoded), &mut dest).unwrap();
            black_box(dest[0])
        });
    });
}

criterion_group!(
    benches,
    bench_cache_insert_under_eviction_pressure,
    bench_cache_get_hit,
    bench_xbzrle_encode,
    bench_xbzrle_decode,
);
criterion_main!(benches);
