use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use layerdrive_core::{ConvBackend, ConvDispatcher, ConvLayerSpec, CpuBackend, WgpuBackend};
use layerdrive_utils::gpu::{GpuContext, GpuContextOptions};

fn setup_gpu() -> Option<WgpuBackend> {
    GpuContext::init_with_fallback(&GpuContextOptions::default())
        .context()
        .cloned()
        .and_then(|ctx| WgpuBackend::new(ctx, None).ok())
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i % 100) as f32 / 100.0).collect()
}

fn bench_layer<B: ConvBackend>(
    c: &mut Criterion,
    group_name: &str,
    backend: &B,
    layers: &[(&str, ConvLayerSpec)],
) {
    let mut group = c.benchmark_group(group_name);
    let dispatcher = ConvDispatcher::new(backend);
    for (name, spec) in layers {
        let input = backend.upload(&ramp(spec.input_len()), "bench_input").unwrap();
        let weights = backend.upload(&ramp(spec.weight_len()), "bench_weights").unwrap();
        let bias = backend.upload(&ramp(spec.bias_len()), "bench_bias").unwrap();
        let mut output = backend.allocate(spec.output_len(), "bench_output").unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(name), spec, |b, spec| {
            b.iter(|| {
                dispatcher
                    .run(
                        black_box(spec),
                        black_box(&input),
                        black_box(&weights),
                        black_box(&bias),
                        &mut output,
                    )
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn benchmark_mnist_layers(c: &mut Criterion) {
    // Layer shapes of the three-layer MNIST network.
    let layers = [
        ("conv1", ConvLayerSpec::new(1, 16, 28, 28, 5, 5, 1, 1, true).unwrap()),
        ("conv2", ConvLayerSpec::new(16, 32, 24, 24, 5, 5, 1, 1, true).unwrap()),
        ("conv3", ConvLayerSpec::new(32, 10, 20, 20, 20, 20, 1, 1, false).unwrap()),
    ];

    bench_layer(c, "cpu", &CpuBackend::new(), &layers);

    match setup_gpu() {
        Some(gpu) => bench_layer(c, "wgpu", &gpu, &layers),
        None => eprintln!("Skipping GPU benchmark (no adapter available)"),
    }
}

criterion_group!(benches, benchmark_mnist_layers);
criterion_main!(benches);
