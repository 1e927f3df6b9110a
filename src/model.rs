use crate::config::{IMAGE_CHANNELS, IMAGE_HEIGHT, IMAGE_WIDTH, NUM_CLASSES};
use crate::error::{Error, Result};
use crate::layers::{
    Conv2Dlayer, FcLayer, FlattenLayer, Layer, MaxPoolLayer, Padding, ReluLayer, SoftMaxLayer,
    TanhLayer,
};
use ndarray::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub trait Module {
    /// Training forward pass: caches whatever `backward` needs.
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32>; // Input is (batch_size, ...)

    /// Inference forward pass: same output as `forward`, nothing cached.
    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32>;

    /// Backward pass
    ///
    /// The `backward` function receives a gradient `dz` which corresponds to dLoss/dz,
    /// where z is the current layer output.
    /// The job of the backward pass is to combine its 'local gradients' - namely dz/dx, dz/dw -
    /// with this incoming gradient - dLoss/dz - using the chain rule.
    /// The backward should:
    /// - return dLoss/dx = dz/dx * dLoss/dz
    /// - fill in the gradients for the layer's own weights dLoss/dw = dz/dw * dLoss/dz
    ///
    /// Note:
    /// - the dz/dx Jacobian matrix is not materialized (too wasteful). Instead, each layer
    /// directly computes the matrix-vector product of interest.
    /// - the shape of the function output - which corresponds to dLoss/dx - is the same shape
    /// as the layer inputs.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32>;

    fn zero_grad(&mut self);

    /// Trainable tensors paired with their gradient from the last backward.
    fn params(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }
}

pub struct Param<'a> {
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: Option<ArrayViewD<'a, f32>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
    Softmax,
}

/// Declarative description of one stage of a sequential model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        filters: usize,
        kernel_size: (usize, usize),
        activation: Activation,
        padding: Padding,
    },
    MaxPool {
        pool_size: (usize, usize),
        stride: (usize, usize),
    },
    Flatten,
    Dense {
        units: usize,
        activation: Activation,
    },
}

/// Per-example shape flowing between layers (the batch axis is implicit).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Image {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl Shape {
    pub fn size(&self) -> usize {
        match *self {
            Shape::Image {
                channels,
                height,
                width,
            } => channels * height * width,
            Shape::Flat(n) => n,
        }
    }

    /// Full array shape for a batch of `batch_size` examples.
    pub fn batched(&self, batch_size: usize) -> Vec<usize> {
        match *self {
            Shape::Image {
                channels,
                height,
                width,
            } => vec![batch_size, channels, height, width],
            Shape::Flat(n) => vec![batch_size, n],
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Image {
                channels,
                height,
                width,
            } => write!(f, "({channels}, {height}, {width})"),
            Shape::Flat(n) => write!(f, "({n})"),
        }
    }
}

pub const MNIST_INPUT: Shape = Shape::Image {
    channels: IMAGE_CHANNELS,
    height: IMAGE_HEIGHT,
    width: IMAGE_WIDTH,
};

/// conv(32, 5x5, relu) -> pool 2 -> conv(64, 5x5, relu) -> pool 2 -> flatten
/// -> dense(128, tanh) -> dense(10, softmax)
pub fn mnist_cnn() -> Vec<LayerSpec> {
    vec![
        LayerSpec::Conv2d {
            filters: 32,
            kernel_size: (5, 5),
            activation: Activation::Relu,
            padding: Padding::Same,
        }, // (1, 28, 28) --> (32, 28, 28)
        LayerSpec::MaxPool {
            pool_size: (2, 2),
            stride: (2, 2),
        }, // --> (32, 14, 14)
        LayerSpec::Conv2d {
            filters: 64,
            kernel_size: (5, 5),
            activation: Activation::Relu,
            padding: Padding::Same,
        }, // --> (64, 14, 14)
        LayerSpec::MaxPool {
            pool_size: (2, 2),
            stride: (2, 2),
        }, // --> (64, 7, 7)
        LayerSpec::Flatten, // --> 3136
        LayerSpec::Dense {
            units: 128,
            activation: Activation::Tanh,
        },
        LayerSpec::Dense {
            units: NUM_CLASSES,
            activation: Activation::Softmax,
        },
    ]
}

impl LayerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            LayerSpec::Conv2d { .. } => "conv2d",
            LayerSpec::MaxPool { .. } => "max_pool",
            LayerSpec::Flatten => "flatten",
            LayerSpec::Dense { .. } => "dense",
        }
    }

    /// Output shape for `input`, or why this layer cannot follow it.
    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        let invalid =
            |reason: String| Err(Error::InvalidModel(format!("{}: {reason}", self.name())));
        match (*self, input) {
            (
                LayerSpec::Conv2d {
                    filters,
                    kernel_size: (kh, kw),
                    activation,
                    padding,
                },
                Shape::Image { height, width, .. },
            ) => {
                if filters == 0 || kh == 0 || kw == 0 {
                    return invalid("filters and kernel size must be positive".to_string());
                }
                if activation == Activation::Softmax {
                    return invalid("softmax needs a flat input".to_string());
                }
                match (padding.output_size(height, kh), padding.output_size(width, kw)) {
                    (Some(height), Some(width)) => Ok(Shape::Image {
                        channels: filters,
                        height,
                        width,
                    }),
                    _ => invalid(format!("kernel {kh}x{kw} does not fit input {input}")),
                }
            }
            (
                LayerSpec::MaxPool {
                    pool_size: (ph, pw),
                    stride,
                },
                Shape::Image {
                    channels,
                    height,
                    width,
                },
            ) => {
                if ph == 0 || pw == 0 {
                    return invalid("pool size must be positive".to_string());
                }
                if stride != (ph, pw) {
                    return invalid(
                        "only non-overlapping pooling (stride == pool size)".to_string(),
                    );
                }
                if height < ph || width < pw {
                    return invalid(format!("window {ph}x{pw} does not fit input {input}"));
                }
                Ok(Shape::Image {
                    channels,
                    height: height / ph,
                    width: width / pw,
                })
            }
            (LayerSpec::Flatten, Shape::Image { .. }) => Ok(Shape::Flat(input.size())),
            (LayerSpec::Dense { units, .. }, Shape::Flat(_)) => {
                if units == 0 {
                    return invalid("units must be positive".to_string());
                }
                Ok(Shape::Flat(units))
            }
            (LayerSpec::Dense { .. }, Shape::Image { .. }) => {
                invalid(format!("input {input} must be flattened first"))
            }
            (_, Shape::Flat(_)) => invalid(format!("needs an image input, got {input}")),
        }
    }

    pub fn param_count(&self, input: Shape) -> usize {
        match *self {
            LayerSpec::Conv2d {
                filters,
                kernel_size: (kh, kw),
                ..
            } => match input {
                Shape::Image { channels, .. } => filters * channels * kh * kw + filters,
                Shape::Flat(_) => 0,
            },
            LayerSpec::Dense { units, .. } => input.size() * units + units,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub name: &'static str,
    pub output_shape: Shape,
    pub params: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NN {
    input_shape: Shape,
    specs: Vec<LayerSpec>,
    pub layers: Vec<Layer>,
}

impl Module for NN {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = input;
        for layer in &mut self.layers {
            x = layer.forward(x);
            log::trace!("[forward] [{}] out: {:?}", layer.name(), x.shape());
        }
        x
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.layers.iter().fold(input, |x, layer| layer.infer(x))
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let mut x = dz;
        // Iterate layers in reverse order, mutate each as we go
        for layer in self.layers.iter_mut().rev() {
            x = layer.backward(x);
        }
        x
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        self.layers.iter_mut().flat_map(|l| l.params()).collect()
    }
}

fn activation_layer(activation: Activation) -> Option<Layer> {
    match activation {
        Activation::Linear => None,
        Activation::Relu => Some(Layer::ReLU(ReluLayer::new())),
        Activation::Tanh => Some(Layer::Tanh(TanhLayer::new())),
        Activation::Softmax => Some(Layer::Softmax(SoftMaxLayer::new())),
    }
}

impl NN {
    /// Builds the layer stack described by `specs`, inferring every layer's
    /// input size from `input_shape`. Weights are drawn from `rng`.
    pub fn build<R: Rng + ?Sized>(
        input_shape: Shape,
        specs: &[LayerSpec],
        rng: &mut R,
    ) -> Result<NN> {
        if specs.is_empty() {
            return Err(Error::InvalidModel("no layers".to_string()));
        }

        let mut layers = Vec::new();
        let mut shape = input_shape;
        for spec in specs {
            let out = spec.output_shape(shape)?;
            match (*spec, shape) {
                (
                    LayerSpec::Conv2d {
                        filters,
                        kernel_size,
                        activation,
                        padding,
                    },
                    Shape::Image { channels, .. },
                ) => {
                    layers.push(Layer::Conv(Conv2Dlayer::new(
                        channels,
                        filters,
                        kernel_size,
                        padding,
                        rng,
                    )));
                    layers.extend(activation_layer(activation));
                }
                (LayerSpec::MaxPool { pool_size, .. }, _) => {
                    layers.push(Layer::Pool(MaxPoolLayer::new(pool_size)))
                }
                (LayerSpec::Flatten, _) => layers.push(Layer::Flatten(FlattenLayer::new())),
                (LayerSpec::Dense { units, activation }, Shape::Flat(features)) => {
                    layers.push(Layer::FC(FcLayer::new(features, units, rng)));
                    layers.extend(activation_layer(activation));
                }
                _ => unreachable!("output_shape rejects {spec:?} after {shape}"),
            }
            shape = out;
        }

        Ok(NN {
            input_shape,
            specs: specs.to_vec(),
            layers,
        })
    }

    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    /// One row per declared layer: its output shape and parameter count.
    pub fn summary(&self) -> Result<Vec<SummaryRow>> {
        let mut shape = self.input_shape;
        let mut rows = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let out = spec.output_shape(shape)?;
            rows.push(SummaryRow {
                name: spec.name(),
                output_shape: out,
                params: spec.param_count(shape),
            });
            shape = out;
        }
        Ok(rows)
    }

    pub fn output_shape(&self) -> Result<Shape> {
        self.specs
            .iter()
            .try_fold(self.input_shape, |shape, spec| spec.output_shape(shape))
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    /// Class probabilities for a batch of images, without touching any cache.
    pub fn predict_proba(&self, images: ArrayD<f32>) -> Result<Array2<f32>> {
        let out = self.infer(images);
        let shape = out.shape().to_vec();
        out.into_dimensionality::<Ix2>()
            .map_err(|_| Error::OutputShape(shape))
    }

    /// Save the neural network to a checkpoint file
    pub fn to_checkpoint(&self, filepath: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(filepath)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Load a neural network from a checkpoint file
    pub fn from_checkpoint(filepath: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(filepath)?);
        let nn: NN = serde_json::from_reader(reader)?;
        nn.check_layers()?;
        Ok(nn)
    }

    /// Checks that `layers` is exactly what `build` makes of `specs`: same
    /// kinds in the same order, with weights of the inferred sizes.
    fn check_layers(&self) -> Result<()> {
        let mismatch = |reason: String| {
            Error::InvalidModel(format!("layers do not match the declared stack: {reason}"))
        };
        if self.specs.is_empty() {
            return Err(Error::InvalidModel("no layers".to_string()));
        }
        let mut layers = self.layers.iter();
        let mut shape = self.input_shape;

        for spec in &self.specs {
            let out = spec.output_shape(shape)?;
            let layer = layers
                .next()
                .ok_or_else(|| mismatch(format!("missing {} layer", spec.name())))?;
            let fits = match (*spec, shape, layer) {
                (
                    LayerSpec::Conv2d {
                        filters,
                        kernel_size,
                        padding,
                        ..
                    },
                    Shape::Image { channels, .. },
                    Layer::Conv(conv),
                ) => {
                    conv.in_channels() == channels
                        && conv.out_channels() == filters
                        && conv.kernel_size() == kernel_size
                        && conv.padding() == padding
                        && conv.kernels_mat.dim()
                            == (filters, channels * kernel_size.0 * kernel_size.1)
                        && conv.b.len() == filters
                }
                (LayerSpec::MaxPool { pool_size, .. }, _, Layer::Pool(pool)) => {
                    pool.pool_size() == pool_size
                }
                (LayerSpec::Flatten, _, Layer::Flatten(_)) => true,
                (LayerSpec::Dense { units, .. }, Shape::Flat(features), Layer::FC(fc)) => {
                    fc.input_size() == features
                        && fc.output_size() == units
                        && fc.weights.dim() == (features, units)
                        && fc.bias.len() == units
                }
                _ => false,
            };
            if !fits {
                return Err(mismatch(format!(
                    "{} layer where {} after {shape} was declared",
                    layer.name(),
                    spec.name()
                )));
            }

            let activation = match *spec {
                LayerSpec::Conv2d { activation, .. } | LayerSpec::Dense { activation, .. } => {
                    activation
                }
                _ => Activation::Linear,
            };
            if let Some(expected) = activation_layer(activation) {
                match layers.next() {
                    Some(layer) if layer.name() == expected.name() => {}
                    Some(layer) => {
                        return Err(mismatch(format!(
                            "{} layer where {} was declared",
                            layer.name(),
                            expected.name()
                        )))
                    }
                    None => return Err(mismatch(format!("missing {} layer", expected.name()))),
                }
            }
            shape = out;
        }

        match layers.next() {
            Some(extra) => Err(mismatch(format!("unexpected trailing {} layer", extra.name()))),
            None => Ok(()),
        }
    }
}
