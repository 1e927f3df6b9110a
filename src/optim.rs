use crate::config::OptimizerKind;
use crate::error::{Error, Result};
use crate::model::{Module, Param, NN};

use ndarray::prelude::*;

/// Probabilities are clipped to [EPSILON, 1 - EPSILON] before the log.
pub const EPSILON: f32 = 1e-7;

/// Sparse categorical cross-entropy over a batch of softmax outputs.
///
/// Returns the per-example losses `-ln(p[label])` and the gradient of their
/// mean with respect to `probs`, so the 1/batch_size factor is already applied
/// when the gradient reaches the layers. Where clipping is active the
/// gradient is zero.
pub fn sparse_categorical_crossentropy(
    labels: &[i64],
    probs: &Array2<f32>,
) -> Result<(Array1<f32>, Array2<f32>)> {
    let (batch_size, num_classes) = probs.dim();
    if labels.len() != batch_size {
        return Err(Error::BatchLabels {
            expected: batch_size,
            actual: labels.len(),
        });
    }

    let mut loss = Array1::zeros(batch_size);
    let mut grad = Array2::zeros((batch_size, num_classes));
    for (i, &label) in labels.iter().enumerate() {
        if label < 0 || label as usize >= num_classes {
            return Err(Error::LabelOutOfRange { index: i, label });
        }
        let class = label as usize;
        let p = probs[(i, class)];
        let clipped = p.clamp(EPSILON, 1.0 - EPSILON);
        loss[i] = -clipped.ln();
        if p > EPSILON && p < 1.0 - EPSILON {
            grad[(i, class)] = -1.0 / (p * batch_size as f32);
        }
    }

    Ok((loss, grad))
}

pub trait Optimizer {
    /// Run one optimization step.
    /// Note:
    /// - Assumes forward+backward pass have been done.
    /// - May mutate the optimizer internal state (e.g. moments).
    /// - Parameters without a gradient are left untouched.
    fn step(&mut self, nn: &mut NN);
}

pub fn optimizer(kind: OptimizerKind, learning_rate: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        OptimizerKind::Sgd => Box::new(SGD { learning_rate }),
    }
}

pub struct SGD {
    pub learning_rate: f32,
}

impl Optimizer for SGD {
    fn step(&mut self, nn: &mut NN) {
        for param in nn.params() {
            let Param { mut value, grad } = param;
            if let Some(grad) = grad {
                value.scaled_add(-self.learning_rate, &grad);
            }
        }
    }
}

pub struct Adam {
    pub t: i32,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// First and second moment per parameter tensor, created on first use.
    pub moments: Vec<Option<(ArrayD<f32>, ArrayD<f32>)>>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Adam {
            t: 0,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: EPSILON,
            moments: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, nn: &mut NN) {
        self.t += 1;
        let t_f32 = self.t as f32;

        let params = nn.params();
        if self.moments.len() < params.len() {
            self.moments.resize(params.len(), None);
        }

        for (param, state) in params.into_iter().zip(self.moments.iter_mut()) {
            let Param { mut value, grad } = param;
            let Some(grad) = grad else { continue };
            let (m, v) = state.get_or_insert_with(|| {
                (ArrayD::zeros(grad.raw_dim()), ArrayD::zeros(grad.raw_dim()))
            });

            // m = beta1 * m + (1 - beta1) * grad
            let beta1 = self.beta1;
            m.zip_mut_with(&grad, |m_val, &g_val| {
                *m_val = beta1 * *m_val + (1.0 - beta1) * g_val;
            });

            // v = beta2 * v + (1 - beta2) * grad^2
            let beta2 = self.beta2;
            v.zip_mut_with(&grad, |v_val, &g_val| {
                *v_val = beta2 * *v_val + (1.0 - beta2) * g_val.powi(2);
            });

            // Bias correction
            let m_corr = 1.0 - beta1.powf(t_f32);
            let v_corr = 1.0 - beta2.powf(t_f32);

            // Update weight: w = w - lr * (m / m_corr) / (sqrt(v / v_corr) + eps)
            let (lr, eps) = (self.learning_rate, self.epsilon);
            azip!((p in &mut value, &mv in &*m, &vv in &*v) {
                let m_hat = mv / m_corr;
                let v_hat = vv / v_corr;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
        }
    }
}
