//! Benchmarks for the checkpoint codec

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use proficio_checkpoint::{decode_snapshot, encode_snapshot, CheckpointHeader};
use proficio_core::FusionConfig;
use proficio_fusion::FusionModel;

fn bench_header_parse(c: &mut Criterion) {
    let snapshot = FusionModel::seeded(FusionConfig::compact(64), 1)
        .unwrap()
        .snapshot(10);
    let bytes = encode_snapshot(&snapshot).unwrap();

    c.bench_function("checkpoint_header_parse", |b| {
        b.iter(|| CheckpointHeader::parse(black_box(&bytes)))
    });
}

fn bench_encode_decode(c: &mut Criterion) {
    let snapshot = FusionModel::seeded(FusionConfig::default(), 2)
        .unwrap()
        .snapshot(1000);
    let bytes = encode_snapshot(&snapshot).unwrap();

    let mut group = c.benchmark_group("checkpoint_default_model");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| encode_snapshot(black_box(&snapshot)).unwrap())
    });
    group.bench_function("decode", |b| {
        b.iter(|| decode_snapshot(black_box(&bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_header_parse, bench_encode_decode);
criterion_main!(benches);
