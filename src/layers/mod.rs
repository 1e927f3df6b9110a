pub use crate::layers::activations::{ReluLayer, SoftMaxLayer, TanhLayer};
pub use crate::layers::conv::{Conv2Dlayer, FlattenLayer, MaxPoolLayer, Padding};
pub use crate::layers::fc::FcLayer;
pub use crate::model::{Module, Param};

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

pub mod activations;
pub mod conv;
pub mod fc;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Layer {
    FC(FcLayer),
    Conv(Conv2Dlayer),
    Pool(MaxPoolLayer),
    ReLU(ReluLayer),
    Tanh(TanhLayer),
    Softmax(SoftMaxLayer),
    Flatten(FlattenLayer),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::FC(_) => "dense",
            Layer::Conv(_) => "conv2d",
            Layer::Pool(_) => "max_pool",
            Layer::ReLU(_) => "relu",
            Layer::Tanh(_) => "tanh",
            Layer::Softmax(_) => "softmax",
            Layer::Flatten(_) => "flatten",
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            Layer::FC(l) => l.weights.len() + l.bias.len(),
            Layer::Conv(l) => l.kernels_mat.len() + l.b.len(),
            _ => 0,
        }
    }
}

impl Module for Layer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.forward(input),
            Layer::Conv(l) => l.forward(input),
            Layer::Pool(l) => l.forward(input),
            Layer::ReLU(l) => l.forward(input),
            Layer::Tanh(l) => l.forward(input),
            Layer::Softmax(l) => l.forward(input),
            Layer::Flatten(l) => l.forward(input),
        }
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.infer(input),
            Layer::Conv(l) => l.infer(input),
            Layer::Pool(l) => l.infer(input),
            Layer::ReLU(l) => l.infer(input),
            Layer::Tanh(l) => l.infer(input),
            Layer::Softmax(l) => l.infer(input),
            Layer::Flatten(l) => l.infer(input),
        }
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Layer::FC(l) => l.backward(dz),
            Layer::Conv(l) => l.backward(dz),
            Layer::Pool(l) => l.backward(dz),
            Layer::ReLU(l) => l.backward(dz),
            Layer::Tanh(l) => l.backward(dz),
            Layer::Softmax(l) => l.backward(dz),
            Layer::Flatten(l) => l.backward(dz),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Layer::FC(l) => l.zero_grad(),
            Layer::Conv(l) => l.zero_grad(),
            Layer::Pool(l) => l.zero_grad(),
            Layer::ReLU(l) => l.zero_grad(),
            Layer::Tanh(l) => l.zero_grad(),
            Layer::Softmax(l) => l.zero_grad(),
            Layer::Flatten(l) => l.zero_grad(),
        }
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        match self {
            Layer::FC(l) => l.params(),
            Layer::Conv(l) => l.params(),
            _ => Vec::new(), // no weights in other layers
        }
    }
}
