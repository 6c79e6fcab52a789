// Analysis benchmark - measure patch sampling and decision policy cost
//
// Run with: cargo bench --bench analysis_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use deepfake_common::FaceBox;
use deepfake_decision::{decide, DecisionThresholds};
use deepfake_patch_sampler::{sample, PatchSamplerConfig};

/// Synthetic frame with a gradient so resize work is not degenerate
fn gradient_image(width: u32, height: u32) -> image::RgbImage {
    image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    })
}

fn bench_patch_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch_sampling");
    let config = PatchSamplerConfig::default();

    // Source resolutions covering phone photos through 1080p frames
    let resolutions = vec![(640, 480, "640x480"), (1280, 720, "720p"), (1920, 1080, "1080p")];

    for (width, height, name) in resolutions {
        let image = gradient_image(width, height);
        let face = FaceBox {
            x1: width / 4,
            y1: height / 4,
            x2: width / 2,
            y2: height / 2,
        };

        group.bench_with_input(BenchmarkId::new("with_face", name), &image, |b, image| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(42);
                black_box(sample(image, &[face], &config, &mut rng))
            })
        });

        group.bench_with_input(BenchmarkId::new("grid_only", name), &image, |b, image| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(42);
                black_box(sample(image, &[], &config, &mut rng))
            })
        });
    }

    group.finish();
}

fn bench_decision_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision_policy");
    let thresholds = DecisionThresholds::default();

    // Probability set sizes: single face up to a long video's accumulation
    for size in [1usize, 16, 256, 4096] {
        let probs: Vec<f32> = (0..size).map(|i| (i % 100) as f32 / 100.0).collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &probs, |b, probs| {
            b.iter(|| black_box(decide(probs, &thresholds)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_patch_sampling, bench_decision_policy);
criterion_main!(benches);
