use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use mnist_conv::layers::{Conv2Dlayer, Padding};
use mnist_conv::model::{mnist_cnn, Module, MNIST_INPUT, NN};
use ndarray::{Array4, ArrayD};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;

fn gen_input(rng: &mut StdRng, b: usize, c: usize, h: usize, w: usize) -> ArrayD<f32> {
    Array4::<f32>::random_using((b, c, h, w), Uniform::new(-1.0, 1.0), rng).into_dyn()
}

fn forward_pass_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convolution_Forward");
    let mut rng = StdRng::seed_from_u64(0);

    // (batch_size, in_channels, out_channels, height, width)
    let params = vec![
        (100, 1, 32, 28, 28),   // first MNIST conv
        (100, 32, 64, 14, 14),  // second MNIST conv
        (16, 10, 20, 128, 128), // larger resolution
    ];
    let kernel_size = (5, 5);
    let k = kernel_size.0;

    for (batch_size, in_channels, out_channels, height, width) in params {
        let mut conv_layer = Conv2Dlayer::new(
            in_channels,
            out_channels,
            kernel_size,
            Padding::Same,
            &mut rng,
        );
        let test_input = gen_input(&mut rng, batch_size, in_channels, height, width);

        // same padding keeps the spatial size
        let flops = batch_size * in_channels * out_channels * k * k * height * width;
        group.throughput(Throughput::Elements(flops as u64));

        group.bench_with_input(
            BenchmarkId::new(
                "forward_pass",
                format!("{}x{}x{}x{}", batch_size, in_channels, height, width),
            ),
            &test_input,
            |b, input| {
                b.iter_batched(
                    || input.clone(),
                    |data| conv_layer.forward(black_box(data)),
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

fn backward_pass_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convolution_Backward");
    let mut rng = StdRng::seed_from_u64(1);

    let (batch_size, in_c, out_c, h, w) = (100, 32, 64, 14, 14);
    let kernel = 5;
    let mut conv_layer =
        Conv2Dlayer::new(in_c, out_c, (kernel, kernel), Padding::Same, &mut rng);
    let test_input = gen_input(&mut rng, batch_size, in_c, h, w);

    // backward needs the cache from a forward pass
    let _ = conv_layer.forward(test_input);
    let grad_output = gen_input(&mut rng, batch_size, out_c, h, w);

    group.throughput(Throughput::Elements((batch_size * out_c * h * w) as u64));

    group.bench_function("backward_pass", |b| {
        b.iter_batched(
            || grad_output.clone(),
            |grad| conv_layer.backward(black_box(grad)),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn mnist_cnn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("MNIST_CNN");
    let mut rng = StdRng::seed_from_u64(2);
    let mut nn = NN::build(MNIST_INPUT, &mnist_cnn(), &mut rng).expect("valid architecture");

    let batch_size = 100;
    let input = gen_input(&mut rng, batch_size, 1, 28, 28);
    let grad_output = gen_input(&mut rng, batch_size, 1, 1, 10)
        .into_shape_with_order(vec![batch_size, 10])
        .expect("same number of elements");

    group.bench_function("infer", |bench| {
        bench.iter_batched(
            || input.clone(),
            |data| nn.infer(black_box(data)),
            BatchSize::LargeInput,
        );
    });

    group.bench_function("forward_then_backward", |bench| {
        bench.iter_batched(
            || (input.clone(), grad_output.clone()),
            |(in_data, g_out)| {
                nn.forward(black_box(in_data));
                nn.backward(black_box(g_out))
            },
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

criterion_group!(
    benches,
    forward_pass_benchmark,
    backward_pass_benchmark,
    mnist_cnn_benchmark
);
criterion_main!(benches);
