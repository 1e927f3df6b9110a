use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("image buffer of {len} bytes is not a whole number of {pixels}-pixel images")]
    PartialImage { len: usize, pixels: usize },

    #[error("got {images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },

    #[error("label {label} at index {index} is not a digit class")]
    LabelOutOfRange { index: usize, label: i64 },

    #[error("MNIST file {} not found (enable the `download` feature)", .0.display())]
    MissingDataset(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("expected network output of shape (batch, classes), got {0:?}")]
    OutputShape(Vec<usize>),

    #[error("expected {expected} labels for the batch, got {actual}")]
    BatchLabels { expected: usize, actual: usize },

    #[error("expected a raw {expected}-byte image, got {actual} bytes")]
    RawImageSize { expected: usize, actual: usize },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
