//! Kernel throughput for the merged convolution, bilateral filter and
//! quantized add.
//!
//! Run with: cargo bench --bench benches

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use synet_simd::{
    ActivationKind, Compatibility, ConvParam, ConvWeights, KernelConfig, MergedConvolution8i, QuantParam,
    QuantizedAdd, RbfFlags, RecursiveBilateralFilter, TensorMut, TensorRef, TensorStats, Tier,
};

fn pattern(len: usize, modulo: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| ((i * 7919) % modulo) as f32 * scale - 0.5).collect()
}

fn bench_merged(c: &mut Criterion) {
    let mut group = c.benchmark_group("merged_cdc");
    let (h, w, src_c, mid_c, dst_c) = (56, 56, 24, 144, 24);
    let convs = [
        ConvParam::dense(src_c, h, w, mid_c).activation(ActivationKind::Relu),
        ConvParam::depthwise(mid_c, h, w).activation(ActivationKind::RestrictRange),
        ConvParam::dense(mid_c, h, w, dst_c),
    ];
    let weights: Vec<Vec<f32>> = convs
        .iter()
        .map(|p| {
            let len = if p.is_depthwise() {
                p.kernel_size() * p.src_c
            } else {
                p.kernel_size() * p.src_c * p.dst_c
            };
            pattern(len, 101, 0.01)
        })
        .collect();
    let biases: Vec<Vec<f32>> = convs.iter().map(|p| vec![0.01; p.dst_c]).collect();
    let params = [Vec::new(), vec![0.0, 6.0], Vec::new()];
    let cw: Vec<ConvWeights<'_>> = (0..3)
        .map(|i| ConvWeights {
            weight: &weights[i],
            bias: Some(&biases[i]),
            params: &params[i],
        })
        .collect();
    let stats = [
        TensorStats::new(vec![-1.0; src_c], vec![1.0; src_c]),
        TensorStats::new(vec![0.0; mid_c], vec![6.0; mid_c]),
        TensorStats::new(vec![-8.0; dst_c], vec![8.0; dst_c]),
    ];
    let src = pattern(h * w * src_c, 97, 0.01);
    let mut dst = vec![0f32; h * w * dst_c];

    let mut tiers = vec![Tier::Sse41, Tier::Avx2];
    if synet_simd::detect() != Tier::Sse41 {
        tiers.push(synet_simd::detect());
    }
    tiers.dedup();
    group.throughput(Throughput::Elements((h * w * mid_c * (src_c + 9 + dst_c)) as u64));
    for tier in tiers {
        let Ok(mut conv) =
            MergedConvolution8i::new(1, &convs, Compatibility::PRECISE, KernelConfig::with_tier(tier))
        else {
            continue;
        };
        if conv.set_params(&cw, &stats).is_err() {
            continue;
        }
        group.bench_with_input(BenchmarkId::new("forward", tier.name()), &tier, |b, _| {
            b.iter(|| {
                let _ = conv.forward(black_box(TensorRef::F32(&src)), None, TensorMut::F32(&mut dst));
            });
        });
    }
    group.finish();
}

fn bench_bilateral(c: &mut Criterion) {
    let mut group = c.benchmark_group("bilateral");
    let (w, h) = (640, 480);
    for ch in [1usize, 3] {
        let src: Vec<u8> = (0..w * h * ch).map(|i| ((i * 31) % 251) as u8).collect();
        let mut dst = vec![0u8; w * h * ch];
        group.throughput(Throughput::Elements((w * h) as u64));
        for (name, flags) in [("fast", RbfFlags::FAST), ("precise", RbfFlags::PRECISE)] {
            let Ok(mut filter) = RecursiveBilateralFilter::new(w, h, ch, 0.2, 0.1, flags) else {
                continue;
            };
            group.bench_with_input(BenchmarkId::new(name, ch), &ch, |b, _| {
                b.iter(|| {
                    let _ = filter.run(black_box(&src), w * ch, &mut dst, w * ch);
                });
            });
        }
    }
    group.finish();
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantized_add");
    let len = 1 << 16;
    let a: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    let b: Vec<u8> = (0..len).map(|i| ((i * 3) % 256) as u8).collect();
    let mut dst = vec![0u8; len];
    let q = QuantParam::from_range(-2.0, 2.0);
    if let Ok(add) = QuantizedAdd::new(q, q, QuantParam::from_range(-4.0, 4.0), ActivationKind::Relu, &[]) {
        group.throughput(Throughput::Elements(len as u64));
        group.bench_function("relu", |bencher| {
            bencher.iter(|| {
                let _ = add.forward(black_box(&a), black_box(&b), &mut dst);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merged, bench_bilateral, bench_add);
criterion_main!(benches);
