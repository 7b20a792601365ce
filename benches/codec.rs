#![allow(missing_docs)]

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rowcode::{ChunkRead, DecodeOptions, Response, Rowcode, Value};
use std::hint::black_box;

fn generate_catalog(count: usize) -> Value {
    Value::array((0..count).map(|i| {
        Value::object([
            ("id", Value::from(i as f64)),
            ("name", Value::from(format!("item-{i}"))),
            (
                "tags",
                Value::array([Value::from("fresh"), Value::from("sale")]),
            ),
        ])
    }))
}

fn generate_aliased(count: usize) -> Value {
    let shared = Value::object([
        ("vendor", Value::from("acme")),
        ("terms", Value::from("net-30")),
    ]);
    Value::array((0..count).map(|_| shared.clone()))
}

// --- BENCHMARKS ---

fn bench_encode(c: &mut Criterion) {
    let item_count = 10_000;
    let flat = generate_catalog(item_count);
    let aliased = generate_aliased(item_count);

    let wire_len = Rowcode::encode_to_vec(flat.clone())
        .expect("Encode failed")
        .len();
    println!("Encode wire size: {} bytes", wire_len);

    let mut group = c.benchmark_group("Encode");
    group.throughput(Throughput::Bytes(wire_len as u64));

    // 1. Flat data, every value inline
    group.bench_function("encode_catalog", |b| {
        b.iter(|| Rowcode::encode_to_vec(black_box(flat.clone())).expect("Encode failed"));
    });

    // 2. One shared row referenced from every position
    group.bench_function("encode_aliased", |b| {
        b.iter(|| Rowcode::encode_to_vec(black_box(aliased.clone())).expect("Encode failed"));
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let item_count = 10_000;
    let bytes = Rowcode::encode_to_vec(generate_catalog(item_count)).expect("Encode failed");
    println!("Decode wire size: {} bytes", bytes.len());

    let mut group = c.benchmark_group("Decode");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    // 1. Whole wire in one push
    group.bench_function("decode_one_push", |b| {
        b.iter(|| Rowcode::decode_from_slice(black_box(&bytes)).expect("Decode failed"));
    });

    // 2. Transport-sized pieces through the resumable parser
    group.bench_function("decode_chunked_64", |b| {
        b.iter(|| {
            let mut response = Response::new(DecodeOptions::default());
            for piece in bytes.chunks(64) {
                response.push(piece).expect("Push failed");
            }
            let ChunkRead::Ready(value) = response.read_root() else {
                panic!("Root should be ready");
            };
            black_box(value);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
