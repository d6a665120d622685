//! Benchmarks for the per-tag tracker

use aoatrack::{local_to_polar, project, Pose, TargetTracker, TrackerConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

/// Raw readings for `n_tags` tags walking parallel lanes, `n_steps` samples each
fn create_test_readings(n_tags: u8, n_steps: usize) -> Vec<(u8, i32, i16, f64)> {
    let mut readings = Vec::with_capacity(n_tags as usize * n_steps);
    for step in 0..n_steps {
        let t = step as f64 * 0.1;
        for tag in 0..n_tags {
            let x = -2.0 + 0.4 * t + tag as f64 * 0.3;
            let y = 1.5 + tag as f64 * 0.5;
            let (d, a) = local_to_polar(x, y);
            readings.push((
                tag,
                (d * 1000.0) as i32,
                (a.to_degrees() * 100.0) as i16,
                t,
            ));
        }
    }
    readings
}

fn bench_single_tag_ingest(c: &mut Criterion) {
    let readings = create_test_readings(1, 100);

    c.bench_function("ingest_single_tag_100_steps", |b| {
        b.iter_batched(
            || TargetTracker::new(TrackerConfig::default()),
            |tracker| {
                for &(tag, d, a, t) in &readings {
                    black_box(tracker.ingest(tag, d, a, t));
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_multi_tag_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_various_tag_counts");

    for &n_tags in &[1u8, 4, 16, 64] {
        let readings = create_test_readings(n_tags, 50);

        group.bench_with_input(
            BenchmarkId::new("tags", n_tags),
            &readings,
            |b, readings| {
                b.iter_batched(
                    || TargetTracker::new(TrackerConfig::default()),
                    |tracker| {
                        for &(tag, d, a, t) in readings {
                            black_box(tracker.ingest(tag, d, a, t));
                        }
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_state_and_projection(c: &mut Criterion) {
    let tracker = TargetTracker::new(TrackerConfig::default());
    for &(tag, d, a, t) in &create_test_readings(8, 20) {
        tracker.ingest(tag, d, a, t);
    }
    let pose = Pose::new(12.0, -3.0, 0.7);

    c.bench_function("get_state_and_project_8_tags", |b| {
        b.iter(|| {
            for tag in 0..8u8 {
                if let Some(track) = tracker.get_state(black_box(tag)) {
                    black_box(project(&track, &pose, 2.0, 0.1));
                }
            }
        })
    });
}

criterion_group!(
    benches,
    bench_single_tag_ingest,
    bench_multi_tag_ingest,
    bench_state_and_projection
);
criterion_main!(benches);
