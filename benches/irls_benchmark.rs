// ========================================================================================
//
//                 WEIGHTED LOGISTIC IRLS BENCHMARK
//
// ========================================================================================
//
// Measures one full weighted logistic fit (aliasing check, IRLS iterations and the
// final covariance) as the number of school/group rows grows.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use matchrate::model::irls::{IrlsOptions, fit_weighted_logit, inverse_logit};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Row counts to test.
const ROW_COUNTS: [usize; 4] = [250, 1_000, 4_000, 16_000];
/// Columns of the simulated design, intercept included.
const NUM_COLUMNS: usize = 12;

/// A dense design with proportion responses and positive prior weights,
/// mimicking a model with a few categorical contrasts and interactions.
fn simulate(rows: usize, seed: u64) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array2::from_shape_fn((rows, NUM_COLUMNS), |(_, j)| match j {
        0 => 1.0,
        1..=3 => rng.gen_range(0.0..1.0),
        _ => {
            if rng.gen_range(0.0..1.0) < 0.5 {
                1.0
            } else {
                -1.0
            }
        }
    });
    let beta: Array1<f64> = (0..NUM_COLUMNS)
        .map(|j| if j == 0 { -0.5 } else { 0.3 / j as f64 })
        .collect();
    let y = x
        .dot(&beta)
        .mapv(|eta| (inverse_logit(eta) + rng.gen_range(-0.1..0.1)).clamp(0.0, 1.0));
    let w = Array1::from_shape_fn(rows, |_| rng.gen_range(0.2..2.0));
    (x, y, w)
}

fn bench_irls(c: &mut Criterion) {
    let options = IrlsOptions::default();
    let mut group = c.benchmark_group("fit_weighted_logit");
    for &rows in &ROW_COUNTS {
        let (x, y, w) = simulate(rows, 7);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                let fit = fit_weighted_logit(black_box(x.view()), black_box(y.view()), black_box(w.view()), &options);
                black_box(fit)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_irls);
criterion_main!(benches);
