use ndarray::prelude::*;
use std::fmt;

/// Index of the largest entry of each row. NaN never wins.
pub fn argmax_rows(probs: &Array2<f32>) -> Vec<usize> {
    probs
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (idx, &p)| {
                    if p > best.1 {
                        (idx, p)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Number of rows whose argmax equals the integer label.
pub fn correct_predictions(labels: &[i64], probs: &Array2<f32>) -> usize {
    argmax_rows(probs)
        .into_iter()
        .zip(labels)
        .filter(|(pred, &label)| *pred as i64 == label)
        .count()
}

/// Example-weighted running totals of loss and accuracy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tally {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl Tally {
    pub fn record(&mut self, losses: &Array1<f32>, correct: usize) {
        self.loss_sum += losses.iter().map(|&l| l as f64).sum::<f64>();
        self.correct += correct;
        self.seen += losses.len();
    }

    pub fn merge(mut self, other: Tally) -> Tally {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.seen += other.seen;
        self
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn metrics(&self) -> Metrics {
        if self.seen == 0 {
            return Metrics {
                loss: f32::NAN,
                accuracy: f32::NAN,
            };
        }
        Metrics {
            loss: (self.loss_sum / self.seen as f64) as f32,
            accuracy: self.correct as f32 / self.seen as f32,
        }
    }
}

/// Mean loss and accuracy over some set of examples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    pub loss: f32,
    pub accuracy: f32,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loss: {:.4} - accuracy: {:.4}", self.loss, self.accuracy)
    }
}
