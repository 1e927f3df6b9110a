use crate::config::{IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_PIXELS, IMAGE_WIDTH, NUM_CLASSES};
use crate::error::{Error, Result};
use crate::mnist_dataset::RawSplit;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A prepared split: normalized images and integer labels, index-aligned.
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array4<f32>, // (len, channels, height, width), values in [0, 1]
    labels: Vec<i64>,
}

/// One (image, label) pair borrowed from a [`Dataset`].
#[derive(Debug, Clone, Copy)]
pub struct Example<'a> {
    pub image: ArrayView3<'a, f32>, // (channels, height, width)
    pub label: i64,
}

/// A group of examples materialized together for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array4<f32>, // (batch_size, channels, height, width)
    pub labels: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Dataset {
    /// Reshapes raw images to (1, 28, 28), scales pixels to [0, 1] and casts
    /// labels to `i64`.
    pub fn from_raw(raw: &RawSplit) -> Result<Self> {
        Dataset::from_raw_prefix(raw, usize::MAX)
    }

    /// Same as [`Dataset::from_raw`], but only the first `len` examples (or
    /// the whole split if shorter) are converted. The whole split is still
    /// validated.
    pub fn from_raw_prefix(raw: &RawSplit, len: usize) -> Result<Self> {
        if raw.images.len() % IMAGE_PIXELS != 0 {
            return Err(Error::PartialImage {
                len: raw.images.len(),
                pixels: IMAGE_PIXELS,
            });
        }
        let total = raw.images.len() / IMAGE_PIXELS;
        if total != raw.labels.len() {
            return Err(Error::LengthMismatch {
                images: total,
                labels: raw.labels.len(),
            });
        }
        if let Some((index, &label)) = raw
            .labels
            .iter()
            .enumerate()
            .find(|(_, &l)| l as usize >= NUM_CLASSES)
        {
            return Err(Error::LabelOutOfRange {
                index,
                label: label as i64,
            });
        }

        let kept = len.min(total);
        let pixels: Vec<f32> = raw.images[..kept * IMAGE_PIXELS]
            .iter()
            .map(|&p| p as f32 / 255.0)
            .collect();
        let images =
            Array4::from_shape_vec((kept, IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH), pixels)?;
        let labels = raw.labels[..kept].iter().map(|&l| l as i64).collect();

        Ok(Dataset { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Example<'_>> {
        let label = *self.labels.get(index)?;
        Some(Example {
            image: self.images.index_axis(Axis(0), index),
            label,
        })
    }

    fn gather(&self, indices: &[usize]) -> Batch {
        Batch {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Draws elements in random order from a bounded buffer that is refilled
/// from `source` as elements leave it.
///
/// The buffer holds at most `capacity` elements. With a capacity at least as
/// large as the source this is a uniform shuffle; a capacity of 1 keeps order.
pub struct ShuffleBuffer<I: Iterator, R> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
    pub fn new(source: I, capacity: usize, rng: R) -> Self {
        let capacity = capacity.max(1);
        ShuffleBuffer {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng,
        }
    }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.buffer.len());
        Some(self.buffer.swap_remove(pick))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (lo, hi) = self.source.size_hint();
        let held = self.buffer.len();
        (lo + held, hi.map(|h| h + held))
    }
}

/// A restartable take -> shuffle -> batch pipeline over a [`Dataset`].
///
/// The pipeline itself is immutable; each call to [`Pipeline::epoch`] builds a
/// fresh lazy iterator, so no state leaks from one epoch into the next.
#[derive(Debug, Clone)]
pub struct Pipeline {
    dataset: Dataset,
    take: Option<usize>,
    shuffle_buffer: Option<usize>,
    batch_size: usize,
    seed: Option<u64>,
}

impl Pipeline {
    pub fn new(dataset: Dataset) -> Self {
        Pipeline {
            dataset,
            take: None,
            shuffle_buffer: None,
            batch_size: 1,
            seed: None,
        }
    }

    /// Restrict to the first `n` examples (or the whole split if shorter).
    pub fn take(mut self, n: usize) -> Self {
        self.take = Some(n);
        self
    }

    pub fn shuffle(mut self, buffer_size: usize) -> Self {
        self.shuffle_buffer = Some(buffer_size);
        self
    }

    pub fn batch(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        self.batch_size = batch_size;
        self
    }

    /// Fix the shuffle order: epoch `e` then always yields the same batches.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of examples a full epoch yields.
    pub fn len(&self) -> usize {
        match self.take {
            Some(n) => n.min(self.dataset.len()),
            None => self.dataset.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches per epoch, counting a final short batch.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn epoch(&self, epoch: u64) -> Batches<'_> {
        let order: Box<dyn Iterator<Item = usize>> = match self.shuffle_buffer {
            Some(capacity) => {
                let rng = match self.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch)),
                    None => StdRng::from_entropy(),
                };
                Box::new(ShuffleBuffer::new(0..self.len(), capacity, rng))
            }
            None => Box::new(0..self.len()),
        };
        Batches {
            dataset: &self.dataset,
            order,
            batch_size: self.batch_size,
        }
    }
}

/// Lazy iterator over the batches of one epoch.
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Box<dyn Iterator<Item = usize> + 'a>,
    batch_size: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let indices: Vec<usize> = self.order.by_ref().take(self.batch_size).collect();
        if indices.is_empty() {
            return None;
        }
        Some(self.dataset.gather(&indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(len: usize) -> RawSplit {
        RawSplit {
            images: (0..len * IMAGE_PIXELS).map(|i| (i % 256) as u8).collect(),
            labels: (0..len).map(|i| (i % 10) as u8).collect(),
        }
    }

    #[test]
    fn rejects_malformed_splits() {
        let mut partial = raw(2);
        partial.images.pop();
        assert!(matches!(
            Dataset::from_raw(&partial),
            Err(Error::PartialImage { .. })
        ));

        let mut short_labels = raw(3);
        short_labels.labels.pop();
        assert!(matches!(
            Dataset::from_raw(&short_labels),
            Err(Error::LengthMismatch {
                images: 3,
                labels: 2
            })
        ));

        let mut bad_label = raw(3);
        bad_label.labels[1] = 10;
        assert!(matches!(
            Dataset::from_raw(&bad_label),
            Err(Error::LabelOutOfRange {
                index: 1,
                label: 10
            })
        ));
    }

    #[test]
    fn example_keeps_pixel_layout() {
        let dataset = Dataset::from_raw(&raw(2)).unwrap();
        let example = dataset.get(1).unwrap();
        assert_eq!(example.image.dim(), (1, 28, 28));
        assert_eq!(example.label, 1);
        // second image starts at raw byte 784 -> 784 % 256 = 16
        assert_eq!(example.image[[0, 0, 0]], 16.0 / 255.0);
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn unshuffled_pipeline_keeps_order_and_short_tail() {
        let pipeline = Pipeline::new(Dataset::from_raw(&raw(7)).unwrap())
            .take(5)
            .batch(2);
        let labels: Vec<Vec<i64>> = pipeline.epoch(0).map(|b| b.labels).collect();
        assert_eq!(labels, vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(pipeline.num_batches(), 3);
    }

    #[test]
    fn shuffle_buffer_is_a_permutation() {
        let rng = StdRng::seed_from_u64(3);
        let mut out: Vec<usize> = ShuffleBuffer::new(0..100, 10, rng).collect();
        assert_ne!(out, (0..100).collect::<Vec<_>>());
        out.sort_unstable();
        assert_eq!(out, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn small_buffer_bounds_displacement() {
        // An element can only leave the buffer after it entered it, and the
        // buffer holds 4 elements, so output position i is at most i + 3.
        let rng = StdRng::seed_from_u64(11);
        for (position, value) in ShuffleBuffer::new(0..50, 4, rng).enumerate() {
            assert!(value <= position + 3);
        }
    }

    #[test]
    fn unit_and_empty_buffers_keep_order() {
        for capacity in [0, 1] {
            let rng = StdRng::seed_from_u64(0);
            let out: Vec<usize> = ShuffleBuffer::new(0..20, capacity, rng).collect();
            assert_eq!(out, (0..20).collect::<Vec<_>>());
        }
        let pipeline = Pipeline::new(Dataset::from_raw(&raw(5)).unwrap())
            .shuffle(0)
            .batch(5)
            .seed(Some(1));
        let labels: Vec<i64> = pipeline.epoch(0).flat_map(|b| b.labels).collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn prefix_conversion_keeps_only_leading_examples() {
        let split = raw(6);
        let prefix = Dataset::from_raw_prefix(&split, 4).unwrap();
        assert_eq!(prefix.len(), 4);
        assert_eq!(prefix.images.dim(), (4, 1, 28, 28));
        assert_eq!(prefix.labels, vec![0, 1, 2, 3]);

        let whole = Dataset::from_raw_prefix(&split, 100).unwrap();
        assert_eq!(whole.len(), 6);

        // a bad label past the prefix still fails validation
        let mut bad_tail = raw(6);
        bad_tail.labels[5] = 11;
        assert!(Dataset::from_raw_prefix(&bad_tail, 2).is_err());
    }

    #[test]
    fn seeded_epochs_differ_but_repeat() {
        let pipeline = Pipeline::new(Dataset::from_raw(&raw(40)).unwrap())
            .shuffle(40)
            .batch(40)
            .seed(Some(5));
        let first: Vec<i64> = pipeline.epoch(0).flat_map(|b| b.labels).collect();
        let again: Vec<i64> = pipeline.clone().epoch(0).flat_map(|b| b.labels).collect();
        let second: Vec<i64> = pipeline.epoch(1).flat_map(|b| b.labels).collect();
        assert_eq!(first, again);
        assert_ne!(first, second);
    }
}
