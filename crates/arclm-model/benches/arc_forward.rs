//! Benchmark for the arc forward pass

use aprender::autograd::Tensor;
use arclm_model::{ArcLmModel, ArcModelConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_config() -> ArcModelConfig {
    ArcModelConfig {
        sequence_len: 256,
        vocab_size: 256,
        n_layer: 2,
        n_head: 4,
        n_kv_head: 4,
        n_embd: 64,
        dropout: None,
        seed: Some(0),
    }
}

fn bench_arc_forward(c: &mut Criterion) {
    let mut model = ArcLmModel::new(bench_config()).expect("model creation failed");

    let mut group = c.benchmark_group("arc_forward");

    for seq_len in [8, 32, 64].iter() {
        let ids: Vec<f32> = (0..*seq_len).map(|i| (i % 256) as f32).collect();
        let input = Tensor::new(&ids, &[1, *seq_len]);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("seq_len_{}", seq_len)),
            &input,
            |b, input| {
                b.iter(|| {
                    let _ = black_box(model.forward(black_box(input), 0, true).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_sampled_negatives(c: &mut Criterion) {
    let mut model = ArcLmModel::new(bench_config()).expect("model creation failed");
    let ids: Vec<f32> = (0..32).map(|i| (i % 256) as f32).collect();
    let input = Tensor::new(&ids, &[1, 32]);

    c.bench_function("arc_forward_sampled_seq_len_32", |b| {
        b.iter(|| {
            let _ = black_box(model.forward(black_box(&input), 0, false).unwrap());
        });
    });
}

criterion_group!(benches, bench_arc_forward, bench_sampled_negatives);
criterion_main!(benches);
