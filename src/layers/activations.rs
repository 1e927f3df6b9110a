use crate::model::Module;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReluLayer {
    #[serde(skip)]
    last_input: Option<ArrayD<f32>>,
}

impl ReluLayer {
    pub fn new() -> ReluLayer {
        ReluLayer { last_input: None }
    }
}

impl Module for ReluLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = self.infer(input.clone());
        self.last_input = Some(input);
        out
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        input.mapv_into(|x| x.max(0.0))
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input
            .take()
            .expect("run forward before backward")
            .mapv_into(|x| if x > 0.0 { 1.0 } else { 0.0 })
            * dz
    }

    fn zero_grad(&mut self) {
        self.last_input = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TanhLayer {
    #[serde(skip)]
    last_output: Option<ArrayD<f32>>,
}

impl TanhLayer {
    pub fn new() -> TanhLayer {
        TanhLayer { last_output: None }
    }
}

impl Module for TanhLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = self.infer(input);
        self.last_output = Some(out.clone());
        out
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        input.mapv_into(f32::tanh)
    }

    // d tanh(x) / dx = 1 - tanh(x)^2
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        self.last_output
            .take()
            .expect("run forward before backward")
            .mapv_into(|y| 1.0 - y * y)
            * dz
    }

    fn zero_grad(&mut self) {
        self.last_output = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SoftMaxLayer {
    #[serde(skip)]
    last_output: Option<Array2<f32>>,
}

impl SoftMaxLayer {
    pub fn new() -> SoftMaxLayer {
        SoftMaxLayer { last_output: None }
    }

    fn softmax(input: ArrayD<f32>) -> Array2<f32> {
        let input = input
            .into_dimensionality::<Ix2>()
            .expect("Input to softmax should be 2D");

        let max = input.fold_axis(Axis(1), f32::NEG_INFINITY, |&a, &b| a.max(b));
        // exp(x - max)
        let mut out = input - max.insert_axis(Axis(1));
        out.mapv_inplace(|x| x.exp());

        let sum = out.sum_axis(Axis(1));
        out / sum.insert_axis(Axis(1))
    }
}

impl Module for SoftMaxLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let out = SoftMaxLayer::softmax(input);
        self.last_output = Some(out.clone());
        out.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        SoftMaxLayer::softmax(input).into_dyn()
    }

    /// Jacobian-vector product of softmax, row by row:
    /// dL/dx = p * (dL/dp - sum(dL/dp * p))
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let probs = self
            .last_output
            .take()
            .expect("run forward before backward");
        let dz = dz
            .into_dimensionality::<Ix2>()
            .expect("Softmax backward input should be 2D");

        let dot = (&dz * &probs).sum_axis(Axis(1)).insert_axis(Axis(1));
        (probs * (dz - dot)).into_dyn()
    }

    fn zero_grad(&mut self) {
        self.last_output = None;
    }
}
