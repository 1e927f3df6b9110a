use crate::config::TrainingConfig;
use crate::dataset::{Batch, Dataset, Pipeline};
use crate::error::{Error, Result};
use crate::metrics::{correct_predictions, Metrics, Tally};
use crate::mnist_dataset::{load_mnist, RawSplit};
use crate::model::{mnist_cnn, Module, MNIST_INPUT, NN};
use crate::optim::{optimizer, sparse_categorical_crossentropy, Optimizer};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::ops::Range;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// Mean training loss/accuracy of every epoch.
    pub history: Vec<Metrics>,
    pub test: Metrics,
}

/// take -> shuffle -> batch over the training split, as configured.
pub fn train_pipeline(raw: &RawSplit, config: &TrainingConfig) -> Result<Pipeline> {
    config.validate()?;
    Ok(Pipeline::new(Dataset::from_raw_prefix(raw, config.train_size)?)
        .take(config.train_size)
        .shuffle(config.shuffle_buffer)
        .batch(config.batch_size)
        .seed(config.seed))
}

/// Same steps over the test split, with its own batch size and an
/// independent shuffle stream.
pub fn test_pipeline(raw: &RawSplit, config: &TrainingConfig) -> Result<Pipeline> {
    config.validate()?;
    Ok(Pipeline::new(Dataset::from_raw_prefix(raw, config.test_size)?)
        .take(config.test_size)
        .shuffle(config.shuffle_buffer)
        .batch(config.test_batch_size)
        .seed(config.seed.map(|seed| !seed)))
}

fn progress_bar(len: usize, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

fn probabilities(output: ArrayD<f32>) -> Result<Array2<f32>> {
    let shape = output.shape().to_vec();
    output
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::OutputShape(shape))
}

/// One optimizer step on `batch`. Returns the per-example losses and the
/// number of correct predictions, both measured before the update.
pub fn train_step(
    nn: &mut NN,
    optimizer: &mut dyn Optimizer,
    batch: Batch,
) -> Result<(Array1<f32>, usize)> {
    nn.zero_grad();
    let probs = probabilities(nn.forward(batch.images.into_dyn()))?; // (batch_size, num_classes)
    let (loss, init_grad) = sparse_categorical_crossentropy(&batch.labels, &probs)?;
    let correct = correct_predictions(&batch.labels, &probs);
    nn.backward(init_grad.into_dyn());
    optimizer.step(nn);
    Ok((loss, correct))
}

/// Runs `epochs` passes over `train`, reshuffling every epoch.
pub fn fit(
    nn: &mut NN,
    optimizer: &mut dyn Optimizer,
    train: &Pipeline,
    epochs: usize,
    verbose: bool,
) -> Result<Vec<Metrics>> {
    let pb = progress_bar(epochs * train.num_batches(), verbose);
    let mut history = Vec::with_capacity(epochs);

    for epoch in 0..epochs {
        let mut tally = Tally::default();
        for batch in train.epoch(epoch as u64) {
            let (loss, correct) = train_step(nn, optimizer, batch)?;
            tally.record(&loss, correct);
            pb.set_message(format!("epoch {}/{epochs} - {}", epoch + 1, tally.metrics()));
            pb.inc(1);
        }

        let metrics = tally.metrics();
        pb.suspend(|| log::info!("epoch {}/{epochs} - {metrics}", epoch + 1));
        history.push(metrics);
    }

    pb.finish_and_clear();
    Ok(history)
}

/// Chunks scored at the same time by `evaluate`. Each one holds its own
/// im2col buffers, so this bounds peak memory whatever the core count.
pub const MAX_PARALLEL_CHUNKS: usize = 4;

/// Splits `0..len` into `chunk`-sized ranges, grouped into waves of at most
/// [`MAX_PARALLEL_CHUNKS`] ranges.
fn chunk_waves(len: usize, chunk: usize) -> Vec<Vec<Range<usize>>> {
    let ranges: Vec<Range<usize>> = (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect();
    ranges
        .chunks(MAX_PARALLEL_CHUNKS)
        .map(|wave| wave.to_vec())
        .collect()
}

/// One inference pass over the test pipeline.
///
/// Each pipeline batch is cut into chunks of `batch_size` examples, scored in
/// parallel waves of [`MAX_PARALLEL_CHUNKS`]. Metrics are example-weighted, so
/// the chunk size only affects memory and speed.
pub fn evaluate(nn: &NN, test: &Pipeline, batch_size: usize) -> Result<Metrics> {
    let chunk = batch_size.max(1);
    let mut tally = Tally::default();

    for batch in test.epoch(0) {
        for wave in chunk_waves(batch.len(), chunk) {
            let wave_tally = wave
                .into_par_iter()
                .map(|range| {
                    let images = batch.images.slice(s![range.clone(), .., .., ..]).to_owned();
                    let labels = &batch.labels[range];
                    let probs = nn.predict_proba(images.into_dyn())?;
                    let (loss, _) = sparse_categorical_crossentropy(labels, &probs)?;
                    let mut part = Tally::default();
                    part.record(&loss, correct_predictions(labels, &probs));
                    Ok::<_, Error>(part)
                })
                .try_reduce(Tally::default, |a, b| Ok(a.merge(b)))?;
            tally = tally.merge(wave_tally);
        }
    }

    log::debug!("evaluated {} examples", tally.seen());
    Ok(tally.metrics())
}

fn log_summary(nn: &NN) -> Result<()> {
    log::info!("{:<10} {:>16} {:>10}", "layer", "output shape", "params");
    for row in nn.summary()? {
        log::info!(
            "{:<10} {:>16} {:>10}",
            row.name,
            row.output_shape.to_string(),
            row.params
        );
    }
    log::info!("total params: {}", nn.param_count());
    Ok(())
}

/// Load MNIST, build the CNN, fit it and evaluate it on the test split.
/// The trained model is written to `checkpoint` if one is given.
pub fn train(
    config: &TrainingConfig,
    checkpoint: Option<&Path>,
    verbose: bool,
) -> Result<TrainingReport> {
    // the raw byte splits are dropped once the pipelines hold their prefixes
    let (train_ds, test_ds) = {
        let (train_raw, test_raw) = load_mnist(&config.data_dir)?;
        (
            train_pipeline(&train_raw, config)?,
            test_pipeline(&test_raw, config)?,
        )
    };
    log::info!("[TRAIN] len: {}, batches: {}", train_ds.len(), train_ds.num_batches());
    log::info!("[TEST] len: {}, batches: {}", test_ds.len(), test_ds.num_batches());

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut nn = NN::build(MNIST_INPUT, &mnist_cnn(), &mut rng)?;
    log_summary(&nn)?;

    let mut optimizer = optimizer(config.optimizer, config.learning_rate);
    let history = fit(&mut nn, optimizer.as_mut(), &train_ds, config.epochs, verbose)?;

    let test = evaluate(&nn, &test_ds, config.eval_batch_size)?;
    log::info!("[TEST] {test}");

    if let Some(path) = checkpoint {
        nn.to_checkpoint(path)?;
        log::info!("saved checkpoint to {}", path.display());
    }

    Ok(TrainingReport { history, test })
}

/// Evaluate a saved model on the configured test pipeline.
pub fn evaluate_checkpoint(config: &TrainingConfig, checkpoint: &Path) -> Result<Metrics> {
    let nn = NN::from_checkpoint(checkpoint)?;
    log::info!("loaded checkpoint from {}", checkpoint.display());
    let test_ds = test_pipeline(&load_mnist(&config.data_dir)?.1, config)?;
    let test = evaluate(&nn, &test_ds, config.eval_batch_size)?;
    log::info!("[TEST] {test}");
    Ok(test)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_waves_cover_the_batch_in_bounded_waves() {
        for (len, chunk) in [(0, 100), (37, 5), (10_000, 100), (20_000, 1)] {
            let waves = chunk_waves(len, chunk);
            assert!(waves.iter().all(|w| !w.is_empty() && w.len() <= MAX_PARALLEL_CHUNKS));
            let ranges: Vec<Range<usize>> = waves.into_iter().flatten().collect();
            assert_eq!(ranges.len(), len.div_ceil(chunk));
            let mut next = 0;
            for range in ranges {
                assert_eq!(range.start, next);
                assert!(range.len() <= chunk && !range.is_empty());
                next = range.end;
            }
            assert_eq!(next, len);
        }
    }
}
