use aoa_beacon::{Frame, FrameExtractor, FRAME_HEADER};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

/// Back-to-back valid frames for `tags` tags
fn create_clean_stream(frames: usize, tags: u8) -> Vec<u8> {
    let mut stream = Vec::with_capacity(frames * 33);
    for i in 0..frames {
        let frame = Frame::measurement(1, (i % tags as usize) as u8, 1000 + i as i32, (i % 3000) as i16);
        stream.extend_from_slice(&frame.encode());
    }
    stream
}

/// Valid frames separated by random noise with frequent stray headers
fn create_noisy_stream(frames: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stream = Vec::with_capacity(frames * 48);
    for i in 0..frames {
        for _ in 0..rng.random_range(0..16) {
            stream.push(if rng.random_bool(0.1) {
                FRAME_HEADER
            } else {
                rng.random()
            });
        }
        stream.extend_from_slice(&Frame::measurement(1, (i % 8) as u8, 2000, 0).encode());
    }
    stream
}

fn bench_extractor_chunk_sizes(c: &mut Criterion) {
    let stream = create_clean_stream(1000, 8);
    let mut group = c.benchmark_group("extractor_clean_stream");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for &chunk_len in &[1usize, 16, 64, 512, 4096] {
        group.bench_with_input(
            BenchmarkId::new("chunk", chunk_len),
            &chunk_len,
            |b, &chunk_len| {
                b.iter(|| {
                    let mut extractor = FrameExtractor::new();
                    let mut decoded = 0;
                    for chunk in stream.chunks(chunk_len) {
                        decoded += extractor.feed(black_box(chunk)).0.len();
                    }
                    black_box(decoded)
                })
            },
        );
    }
    group.finish();
}

fn bench_extractor_noise(c: &mut Criterion) {
    let stream = create_noisy_stream(1000, 42);
    let mut group = c.benchmark_group("extractor_noisy_stream");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("chunk_64", |b| {
        b.iter(|| {
            let mut extractor = FrameExtractor::new();
            for chunk in stream.chunks(64) {
                black_box(extractor.feed(black_box(chunk)));
            }
            extractor.counters()
        })
    });
    group.finish();
}

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::measurement(3, 17, -123_456, -2500);
    let bytes = frame.encode();

    c.bench_function("frame_encode", |b| b.iter(|| black_box(&frame).encode()));
    c.bench_function("frame_decode", |b| b.iter(|| Frame::decode(black_box(&bytes))));
}

criterion_group!(
    benches,
    bench_extractor_chunk_sizes,
    bench_extractor_noise,
    bench_frame_codec
);
criterion_main!(benches);
