use crate::config::{IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_PIXELS, IMAGE_WIDTH};
use crate::error::{Error, Result};
use crate::metrics::argmax_rows;
use crate::model::NN;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub probabilities: Vec<f32>,
}

/// Classify one raw 28x28 image (784 bytes, one per pixel, 0-255).
pub fn predict(nn: &NN, image_bytes: &[u8]) -> Result<Prediction> {
    if image_bytes.len() != IMAGE_PIXELS {
        return Err(Error::RawImageSize {
            expected: IMAGE_PIXELS,
            actual: image_bytes.len(),
        });
    }

    // Same preprocessing as the training pipeline
    let pixels: Vec<f32> = image_bytes.iter().map(|&x| x as f32 / 255.0).collect();
    let input = Array4::from_shape_vec((1, IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH), pixels)?;

    let probs = nn.predict_proba(input.into_dyn())?;
    let label = argmax_rows(&probs)[0];
    Ok(Prediction {
        label,
        probabilities: probs.row(0).to_vec(),
    })
}

/// Classify several raw images in parallel. Fails on the first malformed one.
pub fn predict_batch<T: AsRef<[u8]> + Sync>(nn: &NN, images: &[T]) -> Result<Vec<Prediction>> {
    images
        .par_iter()
        .map(|bytes| predict(nn, bytes.as_ref()))
        .collect()
}

/// Run inference using a neural network loaded from a checkpoint
pub fn run(checkpoint_path: &Path, image_paths: &[PathBuf]) -> Result<Vec<Prediction>> {
    let nn = NN::from_checkpoint(checkpoint_path)?;
    log::info!("Loaded checkpoint from: {}", checkpoint_path.display());

    let images = image_paths
        .iter()
        .map(fs::read)
        .collect::<std::io::Result<Vec<_>>>()?;
    let predictions = predict_batch(&nn, &images)?;

    for (path, prediction) in image_paths.iter().zip(&predictions) {
        println!("{}: {}", path.display(), prediction.label);
        println!("Output probabilities: {:?}", prediction.probabilities);
    }
    Ok(predictions)
}
