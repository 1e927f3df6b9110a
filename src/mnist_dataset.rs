use crate::error::{Error, Result};
use mnist::{Mnist, MnistBuilder};
use std::path::Path;

pub const TRAIN_LEN: u32 = 60_000;
pub const TEST_LEN: u32 = 10_000;

const FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// One split as delivered by the IDX files: flattened 28x28 images
/// (pixel values 0-255) and digit labels (0-9).
#[derive(Debug, Clone, Default)]
pub struct RawSplit {
    pub images: Vec<u8>,
    pub labels: Vec<u8>,
}

/// Loads the MNIST train and test splits from `data_dir`.
///
/// With the `download` feature the archives are fetched and unpacked into
/// `data_dir` on first use. Without it the four IDX files must already be there.
pub fn load_mnist(data_dir: &Path) -> Result<(RawSplit, RawSplit)> {
    if !cfg!(feature = "download") {
        for file in FILES {
            let path = data_dir.join(file);
            if !path.is_file() {
                return Err(Error::MissingDataset(path));
            }
        }
    }

    // MnistBuilder wants a trailing separator on the base path.
    let mut base_path = data_dir.to_string_lossy().into_owned();
    if !base_path.ends_with('/') {
        base_path.push('/');
    }
    log::info!("loading MNIST from {base_path}");

    let mut builder = MnistBuilder::new();
    builder
        .base_path(&base_path)
        .training_set_length(TRAIN_LEN)
        .test_set_length(TEST_LEN);
    #[cfg(feature = "download")]
    builder.download_and_extract();

    let Mnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = builder.finalize();

    Ok((
        RawSplit {
            images: trn_img,
            labels: trn_lbl,
        },
        RawSplit {
            images: tst_img,
            labels: tst_lbl,
        },
    ))
}
