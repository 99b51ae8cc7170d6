use criterion::{black_box, criterion_group, criterion_main, Criterion};
use inferbench_core::decoder::{encode_eightbit, encode_raw, EightbitDecoder, RawDecoder};
use inferbench_core::stats::summarize;
use inferbench_core::{MemoryLayout, WeightDecoder};

const ELEMENTS: usize = 256 * 1024;

fn weights() -> Vec<f32> {
    (0..ELEMENTS).map(|i| ((i % 97) as f32 - 48.0) / 48.0).collect()
}

fn layout() -> MemoryLayout {
    let mut layout = MemoryLayout::new();
    layout.push_static("w", ELEMENTS * 4);
    layout
}

fn decode_benchmarks(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let layout = layout();
    let values = weights();
    let raw = encode_raw(&values);
    let eightbit = encode_eightbit(&values);

    c.bench_function("decode_raw_1mib", |b| {
        b.iter(|| runtime.block_on(RawDecoder.decode(black_box(&raw), &layout)))
    });

    let decoder = EightbitDecoder::new();
    c.bench_function("decode_eightbit_1mib", |b| {
        b.iter(|| runtime.block_on(decoder.decode(black_box(&eightbit), &layout)))
    });

    c.bench_function("encode_eightbit_1mib", |b| {
        b.iter(|| encode_eightbit(black_box(&values)))
    });
}

fn stats_benchmarks(c: &mut Criterion) {
    let samples: Vec<f64> = (0..10_000).map(|i| (i % 113) as f64 * 0.25).collect();

    c.bench_function("summarize_10k", |b| {
        b.iter(|| summarize("bench", black_box(&samples)))
    });
}

criterion_group!(benches, decode_benchmarks, stats_benchmarks);
criterion_main!(benches);
