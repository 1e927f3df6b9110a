use mnist_conv::dataset::Batch;
use mnist_conv::layers::Padding;
use mnist_conv::model::{Activation, LayerSpec, Shape, NN};
use mnist_conv::optim::{Adam, SGD};
use mnist_conv::train::train_step;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{distributions::Uniform, Rng, SeedableRng};

/// Generate a random batch of data.
/// This data has the same shape as greyscale images.
fn gen_test_batch(
    rng: &mut StdRng,
    batch_size: usize,
    height: usize,
    width: usize,
    nb_classes: i64,
) -> Batch {
    let images = Array4::from_shape_fn((batch_size, 1, height, width), |_| {
        rng.sample(Uniform::new(0.0f32, 1.0))
    });
    let labels = (0..batch_size)
        .map(|_| rng.gen_range(0..nb_classes))
        .collect();
    Batch { images, labels }
}

fn small_cnn() -> Vec<LayerSpec> {
    vec![
        LayerSpec::Conv2d {
            filters: 4,
            kernel_size: (3, 3),
            activation: Activation::Relu,
            padding: Padding::Same,
        }, // (1, 12, 12) --> (4, 12, 12)
        LayerSpec::MaxPool {
            pool_size: (2, 2),
            stride: (2, 2),
        }, // --> (4, 6, 6)
        LayerSpec::Flatten,
        LayerSpec::Dense {
            units: 32,
            activation: Activation::Tanh,
        },
        LayerSpec::Dense {
            units: 5,
            activation: Activation::Softmax,
        },
    ]
}

#[test]
/// Adam can train a small CNN to overfit a batch of 16 random 12x12
/// greyscale images associated to random integer labels ranging from 0 to 4.
fn test_adam_can_overfit_single_batch() -> Result<(), Box<dyn std::error::Error>> {
    const MAX_RETRIES: u64 = 3;
    const OVERFITTED_LOSS_VALUE: f32 = 0.1;
    const MAX_OPTIM_STEPS: usize = 400;
    let mut last_error = String::new();

    for attempt in 0..MAX_RETRIES {
        let mut rng = StdRng::seed_from_u64(attempt);
        let input = Shape::Image {
            channels: 1,
            height: 12,
            width: 12,
        };
        let mut cnn = NN::build(input, &small_cnn(), &mut rng)?;
        let mut optimizer = Adam::new(0.01);
        let batch = gen_test_batch(&mut rng, 16, 12, 12, 5);

        let mut avg_loss = f32::MAX;
        for optim_step in 1..=MAX_OPTIM_STEPS {
            let (loss, _) = train_step(&mut cnn, &mut optimizer, batch.clone())?;
            avg_loss = loss.mean().unwrap_or(f32::MAX); // batch loss
            if avg_loss < OVERFITTED_LOSS_VALUE {
                println!(
                    "Reached loss<{OVERFITTED_LOSS_VALUE} in attempt {attempt} \
                     with {optim_step} optimisation steps"
                );
                return Ok(());
            }
        }
        last_error = format!("Attempt {attempt} failed: Final loss was {avg_loss}");
        println!("{last_error}");
    }
    Err(format!("Failed to overfit after {MAX_RETRIES} attempts. Last error: {last_error}"))?
}

#[test]
fn sgd_lowers_the_loss_on_a_fixed_batch() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = StdRng::seed_from_u64(17);
    let input = Shape::Image {
        channels: 1,
        height: 12,
        width: 12,
    };
    let mut cnn = NN::build(input, &small_cnn(), &mut rng)?;
    let mut optimizer = SGD { learning_rate: 0.1 };
    let batch = gen_test_batch(&mut rng, 8, 12, 12, 5);

    let (first, _) = train_step(&mut cnn, &mut optimizer, batch.clone())?;
    let mut last = first.clone();
    for _ in 0..50 {
        last = train_step(&mut cnn, &mut optimizer, batch.clone())?.0;
    }
    assert!(last.mean().unwrap() < first.mean().unwrap());
    Ok(())
}
