use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const IMAGE_HEIGHT: usize = 28;
pub const IMAGE_WIDTH: usize = 28;
pub const IMAGE_CHANNELS: usize = 1;
pub const IMAGE_PIXELS: usize = IMAGE_HEIGHT * IMAGE_WIDTH * IMAGE_CHANNELS;
pub const NUM_CLASSES: usize = 10;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Every knob of a training run. `Default` is the reference MNIST setup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub data_dir: PathBuf,
    /// Prefix of the training split that is used at all.
    pub train_size: usize,
    /// Prefix of the test split that is used at all.
    pub test_size: usize,
    pub shuffle_buffer: usize,
    pub batch_size: usize,
    pub test_batch_size: usize,
    /// Compute chunk used by `evaluate`; does not change the reported metrics.
    pub eval_batch_size: usize,
    pub epochs: usize,
    pub optimizer: OptimizerKind,
    pub learning_rate: f32,
    /// Seeds weight init and shuffling. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            data_dir: PathBuf::from("data/"),
            train_size: 20_000,
            test_size: 20_000,
            shuffle_buffer: 20_000,
            batch_size: 100,
            test_batch_size: 20_000,
            eval_batch_size: 100,
            epochs: 5,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.0001,
            seed: None,
        }
    }
}

impl TrainingConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Rejects zero batch sizes and non-positive learning rates.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("test_batch_size", self.test_batch_size),
            ("eval_batch_size", self.eval_batch_size),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
