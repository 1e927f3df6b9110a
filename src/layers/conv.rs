use crate::model::{Module, Param};
use ndarray::prelude::*;
use ndarray::Zip;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Zero-pad so the output keeps the input's spatial size (stride 1).
    #[default]
    Same,
    /// No padding: output is (height - k + 1, width - k + 1).
    Valid,
}

impl Padding {
    /// (before, after) zero rows for one spatial axis. An odd total puts the
    /// extra row after.
    pub fn amounts(self, k: usize) -> (usize, usize) {
        match self {
            Padding::Same => {
                let total = k - 1;
                (total / 2, total - total / 2)
            }
            Padding::Valid => (0, 0),
        }
    }

    pub fn output_size(self, input: usize, k: usize) -> Option<usize> {
        let (before, after) = self.amounts(k);
        (input + before + after + 1).checked_sub(k).filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone)]
struct ConvCache {
    input_dim: (usize, usize, usize, usize),
    patches: Array3<f32>, // (batch_size, locations, in_channels * kh * kw)
}

/// 2D convolution layer with stride 1, computed with the 'img2col' method.
/// pytorch doc: https://docs.pytorch.org/docs/stable/generated/torch.nn.Conv2d.html
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Conv2Dlayer {
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize), // (height, width)
    padding: Padding,
    // weights
    pub kernels_mat: Array2<f32>, // Layout for img2col: (out_channels, in_channels*kh*kw)
    pub b: Array1<f32>,           // One bias per output channel: (out_channels)
    // for backprop
    #[serde(skip)]
    cache: Option<ConvCache>,
    #[serde(skip)]
    pub k_grad: Option<Array2<f32>>, // (out_channels, in_channels*kh*kw)
    #[serde(skip)]
    pub b_grad: Option<Array1<f32>>, // (out_channels)
}

impl Conv2Dlayer {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        padding: Padding,
        rng: &mut R,
    ) -> Conv2Dlayer {
        Conv2Dlayer {
            in_channels,
            out_channels,
            kernel_size,
            padding,
            kernels_mat: Conv2Dlayer::init_kernel(in_channels, out_channels, kernel_size, rng),
            b: Array1::zeros(out_channels),
            cache: None,
            k_grad: None,
            b_grad: None,
        }
    }

    /// Glorot-uniform over fan_in = in_channels*kh*kw, fan_out = out_channels*kh*kw.
    fn init_kernel<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        rng: &mut R,
    ) -> Array2<f32> {
        let (kh, kw) = kernel_size;
        let fan_in = in_channels * kh * kw;
        let fan_out = out_channels * kh * kw;
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Array2::random_using((out_channels, fan_in), Uniform::new(-limit, limit), rng)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        self.kernel_size
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    fn pad(&self, input: Array4<f32>) -> Array4<f32> {
        let (top, bottom) = self.padding.amounts(self.kernel_size.0);
        let (left, right) = self.padding.amounts(self.kernel_size.1);
        if top + bottom + left + right == 0 {
            return input;
        }
        let (batch_size, channels, height, width) = input.dim();
        let mut padded =
            Array4::zeros((batch_size, channels, height + top + bottom, width + left + right));
        padded
            .slice_mut(s![.., .., top..top + height, left..left + width])
            .assign(&input);
        padded
    }

    /// Lays every kernel-sized patch of the padded input out as a row:
    /// (batch_size, in_channels, h, w) -> (batch_size, locations, in_channels*kh*kw).
    /// Locations are numbered row-major over the output feature map.
    fn img2col(&self, padded: &Array4<f32>) -> Array3<f32> {
        let (batch_size, in_channels, height, width) = padded.dim();
        let (kh, kw) = self.kernel_size;
        let nb_locations = (height - kh + 1) * (width - kw + 1);

        let mut patches = Array3::<f32>::zeros((batch_size, nb_locations, in_channels * kh * kw));
        for (feature_maps, mut patches_mat) in padded.outer_iter().zip(patches.outer_iter_mut()) {
            let windows = feature_maps.windows((in_channels, kh, kw));
            for (mut row, patch) in patches_mat.rows_mut().into_iter().zip(windows) {
                row.iter_mut()
                    .zip(patch.iter())
                    .for_each(|(dst, &src)| *dst = src);
            }
        }
        patches
    }

    /// The "img2col" matmul, one batch item at a time:
    /// (out_channels, L) = (out_channels, in_channels*kh*kw) dot (L, in_channels*kh*kw)^T
    fn convolve(&self, patches: &Array3<f32>, out_height: usize, out_width: usize) -> Array4<f32> {
        let batch_size = patches.len_of(Axis(0));
        let mut out = Array4::zeros((batch_size, self.out_channels, out_height, out_width));
        for (patches_mat, mut out_maps) in patches.outer_iter().zip(out.outer_iter_mut()) {
            let mut flat = self.kernels_mat.dot(&patches_mat.t());
            // same bias for every location of an output channel
            flat += &self.b.view().insert_axis(Axis(1));
            let maps = flat
                .into_shape_with_order((self.out_channels, out_height, out_width))
                .expect("(out_channels, L) reshapes to (out_channels, out_height, out_width)");
            out_maps.assign(&maps);
        }
        out
    }

    fn run(&self, input: ArrayD<f32>) -> (Array4<f32>, ConvCache) {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("Conv layer input should be 4D");
        let input_dim = input.dim();
        assert_eq!(input_dim.1, self.in_channels, "[conv] channel mismatch");

        let padded = self.pad(input);
        let (_, _, height, width) = padded.dim();
        let out_height = height - self.kernel_size.0 + 1;
        let out_width = width - self.kernel_size.1 + 1;

        let patches = self.img2col(&padded);
        let out = self.convolve(&patches, out_height, out_width);
        (out, ConvCache { input_dim, patches })
    }
}

impl Module for Conv2Dlayer {
    /// Input: (batch_size, in_channels, height, width)
    /// Output: (batch_size, out_channels, out_height, out_width), where the
    /// output size depends on the padding policy.
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        log::trace!("[forward] [conv] input: {:?}", input.shape());
        let (out, cache) = self.run(input);
        self.cache = Some(cache);
        out.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.run(input).0.into_dyn()
    }

    /// With img2col the forward is OUT = kernels_mat dot patches^T per batch item,
    /// so with dz reshaped to (batch_size, out_channels, locations):
    /// - dL/dkernels_mat = sum over the batch of dz dot patches
    /// - dL/dbias = dz summed over locations and batch
    /// - dL/dpatches = dz^T dot kernels_mat, which is folded back ('col2img') onto
    ///   the padded input, accumulating where patches overlap, then cropped.
    ///
    /// The incoming dz already carries the 1/batch_size of the mean loss.
    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        log::trace!("[backward] [conv] incoming dz: {:?}", dz.shape());
        let cache = self
            .cache
            .take()
            .expect("Run forward before the backward");
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [conv] incoming dz is 4D");
        let (batch_size, out_channels, out_height, out_width) = dz.dim();
        let nb_locations = out_height * out_width;
        let dz = dz
            .to_shape((batch_size, out_channels, nb_locations))
            .expect("[backward] [conv] incoming dz is compatible with img2col shape");

        let mut k_grad = Array2::<f32>::zeros(self.kernels_mat.raw_dim());
        for (dz_sample, patches_mat) in dz.outer_iter().zip(cache.patches.outer_iter()) {
            k_grad += &dz_sample.dot(&patches_mat);
        }
        self.k_grad = Some(k_grad);
        self.b_grad = Some(dz.sum_axis(Axis(2)).sum_axis(Axis(0)));

        let (kh, kw) = self.kernel_size;
        let (top, _) = self.padding.amounts(kh);
        let (left, _) = self.padding.amounts(kw);
        let (_, in_channels, height, width) = cache.input_dim;
        let padded_height = out_height + kh - 1;
        let padded_width = out_width + kw - 1;

        let mut dpadded =
            Array4::<f32>::zeros((batch_size, in_channels, padded_height, padded_width));
        for (dz_sample, mut dinput) in dz.outer_iter().zip(dpadded.outer_iter_mut()) {
            // (L, in_channels*kh*kw) = (out_channels, L)^T dot (out_channels, in_channels*kh*kw)
            let dpatches = dz_sample.t().dot(&self.kernels_mat);
            for (location, patch_grad) in dpatches.outer_iter().enumerate() {
                let top_y = location / out_width;
                let top_x = location % out_width;
                let patch_grad = patch_grad
                    .to_shape((in_channels, kh, kw))
                    .expect("patch gradient row reshapes to (in_channels, kh, kw)");
                let mut window = dinput.slice_mut(s![.., top_y..top_y + kh, top_x..top_x + kw]);
                window += &patch_grad;
            }
        }

        dpadded
            .slice(s![.., .., top..top + height, left..left + width])
            .to_owned()
            .into_dyn()
    }

    fn zero_grad(&mut self) {
        self.k_grad = None;
        self.b_grad = None;
    }

    fn params(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: self.kernels_mat.view_mut().into_dyn(),
                grad: self.k_grad.as_ref().map(|g| g.view().into_dyn()),
            },
            Param {
                value: self.b.view_mut().into_dyn(),
                grad: self.b_grad.as_ref().map(|g| g.view().into_dyn()),
            },
        ]
    }
}

#[derive(Debug, Clone)]
struct PoolCache {
    input_dim: (usize, usize, usize, usize),
    max_mask: Array6<f32>, // (batch_size, channels, height/k, k, width/k, k)
}

/// Non-overlapping max pooling (stride == pool size). Trailing rows/columns
/// that do not fill a whole window are dropped.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MaxPoolLayer {
    pool_size: (usize, usize),
    #[serde(skip)]
    cache: Option<PoolCache>,
}

impl MaxPoolLayer {
    pub fn new(pool_size: (usize, usize)) -> MaxPoolLayer {
        assert!(pool_size.0 > 0 && pool_size.1 > 0);
        MaxPoolLayer {
            pool_size,
            cache: None,
        }
    }

    pub fn pool_size(&self) -> (usize, usize) {
        self.pool_size
    }

    /// Returns the pooled maps and, per window, a one-hot mask of the first
    /// maximum. Routing the gradient to a single winner keeps ties from
    /// duplicating it.
    fn pool(&self, input: ArrayD<f32>) -> (Array4<f32>, PoolCache) {
        let input = input
            .into_dimensionality::<Ix4>()
            .expect("[forward] [maxPool] input is a 4D tensor");
        let input_dim = input.dim();
        let (batch_size, channels, height, width) = input_dim;
        let (kh, kw) = self.pool_size;
        let (out_height, out_width) = (height / kh, width / kw);

        let cropped = input.slice(s![.., .., ..out_height * kh, ..out_width * kw]);
        let input_6d = cropped
            .to_shape((batch_size, channels, out_height, kh, out_width, kw))
            .expect("[forward] [maxPool] cropped input is compatible with the 6D pooling view");

        let mut pooled = Array4::<f32>::zeros((batch_size, channels, out_height, out_width));
        let mut max_mask =
            Array6::<f32>::zeros((batch_size, channels, out_height, kh, out_width, kw));
        for ((b, c, y, x), out) in pooled.indexed_iter_mut() {
            let window = input_6d.slice(s![b, c, y, .., x, ..]);
            let mut best = (0, 0);
            let mut best_val = f32::NEG_INFINITY;
            for ((i, j), &val) in window.indexed_iter() {
                if val > best_val {
                    best_val = val;
                    best = (i, j);
                }
            }
            *out = best_val;
            max_mask[[b, c, y, best.0, x, best.1]] = 1.0;
        }

        (pooled, PoolCache { input_dim, max_mask })
    }
}

impl Module for MaxPoolLayer {
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        let (pooled, cache) = self.pool(input);
        self.cache = Some(cache);
        pooled.into_dyn()
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.pool(input).0.into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let cache = self
            .cache
            .take()
            .expect("[backward] [maxPool] Run forward before backward");
        // dz: (batch_size, channels, height/k, width/k)
        let dz = dz
            .into_dimensionality::<Ix4>()
            .expect("[backward] [maxPool] dz is 4D");
        let (batch_size, channels, out_height, out_width) = dz.dim();
        let (kh, kw) = self.pool_size;

        let dz_6d = dz
            .to_shape((batch_size, channels, out_height, 1, out_width, 1))
            .expect("[backward] [maxPool] dz broadcasts over the pooling windows");

        let mut dwindows = cache.max_mask;
        Zip::from(&mut dwindows)
            .and_broadcast(&dz_6d)
            .for_each(|mask_val, &dz_val| *mask_val *= dz_val);

        let dwindows = dwindows
            .into_shape_with_order((batch_size, channels, out_height * kh, out_width * kw))
            .expect("[backward] [maxPool] window gradient folds back to 4D");

        let (_, _, height, width) = cache.input_dim;
        let mut dinput = Array4::<f32>::zeros((batch_size, channels, height, width));
        dinput
            .slice_mut(s![.., .., ..out_height * kh, ..out_width * kw])
            .assign(&dwindows);
        dinput.into_dyn()
    }

    fn zero_grad(&mut self) {
        self.cache = None;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FlattenLayer {
    #[serde(skip)]
    last_input_shape: Option<Vec<usize>>,
}

impl FlattenLayer {
    pub fn new() -> FlattenLayer {
        FlattenLayer {
            last_input_shape: None,
        }
    }
}

impl Module for FlattenLayer {
    /// (batch_size, channels, height, width) -> (batch_size, channels*height*width)
    fn forward(&mut self, input: ArrayD<f32>) -> ArrayD<f32> {
        self.last_input_shape = Some(input.shape().to_vec());
        self.infer(input)
    }

    fn infer(&self, input: ArrayD<f32>) -> ArrayD<f32> {
        let batch_size = input.shape()[0];
        let features = input.len() / batch_size.max(1);
        input
            .to_shape((batch_size, features))
            .expect("flatten input to 2D array should not fail")
            .to_owned()
            .into_dyn()
    }

    fn backward(&mut self, dz: ArrayD<f32>) -> ArrayD<f32> {
        let shape = self
            .last_input_shape
            .take()
            .expect("Need to do a forward pass before the backward");
        dz.to_shape(shape)
            .expect("should be able to reshape the incoming gradient")
            .to_owned()
    }

    fn zero_grad(&mut self) {
        self.last_input_shape = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn weighted_sum(out: &ArrayD<f32>, weights: &ArrayD<f32>) -> f32 {
        (out * weights).sum()
    }

    #[test]
    fn same_padding_keeps_spatial_size() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2Dlayer::new(1, 3, (5, 5), Padding::Same, &mut rng);
        let out = conv.infer(Array4::<f32>::ones((2, 1, 28, 28)).into_dyn());
        assert_eq!(out.shape(), &[2, 3, 28, 28]);

        let valid = Conv2Dlayer::new(1, 3, (5, 3), Padding::Valid, &mut rng);
        let out = valid.infer(Array4::<f32>::ones((2, 1, 28, 20)).into_dyn());
        assert_eq!(out.shape(), &[2, 3, 24, 18]);
    }

    #[test]
    fn single_pixel_kernel_is_centered() {
        // A 3x3 kernel that only looks at its centre reproduces the input under
        // same padding.
        let mut rng = StdRng::seed_from_u64(0);
        let mut conv = Conv2Dlayer::new(1, 1, (3, 3), Padding::Same, &mut rng);
        conv.kernels_mat.fill(0.0);
        conv.kernels_mat[[0, 4]] = 1.0;
        let input = Array::from_shape_fn((1, 1, 4, 5), |(_, _, y, x)| (y * 5 + x) as f32);
        let out = conv.infer(input.clone().into_dyn());
        assert_eq!(out, input.into_dyn());
    }

    #[test]
    fn conv_gradients_match_finite_differences() {
        // The convolution is linear in both its input and its kernels, so
        // central differences are exact up to rounding.
        let mut rng = StdRng::seed_from_u64(42);
        let mut conv = Conv2Dlayer::new(2, 3, (3, 3), Padding::Same, &mut rng);
        let input =
            Array4::random_using((2, 2, 5, 6), Uniform::new(-1.0, 1.0), &mut rng).into_dyn();
        let upstream =
            Array4::random_using((2, 3, 5, 6), Uniform::new(-1.0, 1.0), &mut rng).into_dyn();

        conv.forward(input.clone());
        let dinput = conv.backward(upstream.clone());
        let k_grad = conv.k_grad.clone().unwrap();
        let b_grad = conv.b_grad.clone().unwrap();

        let eps = 0.1;
        for index in [[0, 0, 0, 0], [1, 1, 2, 3], [0, 1, 4, 5], [1, 0, 2, 0]] {
            let mut plus = input.clone();
            plus[&index[..]] += eps;
            let mut minus = input.clone();
            minus[&index[..]] -= eps;
            let numeric = (weighted_sum(&conv.infer(plus), &upstream)
                - weighted_sum(&conv.infer(minus), &upstream))
                / (2.0 * eps);
            assert_abs_diff_eq!(dinput[&index[..]], numeric, epsilon = 1e-3);
        }

        for index in [(0, 0), (2, 17), (1, 9)] {
            let original = conv.kernels_mat[index];
            conv.kernels_mat[index] = original + eps;
            let plus = weighted_sum(&conv.infer(input.clone()), &upstream);
            conv.kernels_mat[index] = original - eps;
            let minus = weighted_sum(&conv.infer(input.clone()), &upstream);
            conv.kernels_mat[index] = original;
            assert_abs_diff_eq!(k_grad[index], (plus - minus) / (2.0 * eps), epsilon = 1e-3);
        }

        for channel in 0..3 {
            assert_abs_diff_eq!(
                b_grad[channel],
                upstream.index_axis(Axis(1), channel).sum(),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn max_pool_routes_gradient_to_first_max() {
        let mut pool = MaxPoolLayer::new((2, 2));
        // 5x5 input: the last row and column are dropped by flooring.
        let mut input = Array4::<f32>::zeros((1, 1, 5, 5));
        input[[0, 0, 0, 1]] = 3.0;
        input[[0, 0, 1, 0]] = 3.0; // tie: first max in row-major order wins
        input[[0, 0, 3, 3]] = 7.0;
        input[[0, 0, 4, 4]] = 9.0; // outside every window

        let out = pool.forward(input.into_dyn());
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out[[0, 0, 0, 0]], 3.0);
        assert_eq!(out[[0, 0, 1, 1]], 7.0);

        let dz = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0])
            .unwrap()
            .into_dyn();
        let dinput = pool.backward(dz);
        assert_eq!(dinput.shape(), &[1, 1, 5, 5]);
        assert_eq!(dinput[[0, 0, 0, 1]], 1.0);
        assert_eq!(dinput[[0, 0, 1, 0]], 0.0);
        assert_eq!(dinput[[0, 0, 3, 3]], 4.0);
        assert_eq!(dinput[[0, 0, 4, 4]], 0.0);
        assert_abs_diff_eq!(dinput.sum(), 10.0);
    }

    #[test]
    fn flatten_round_trips_gradient_shape() {
        let mut flatten = FlattenLayer::new();
        let out = flatten.forward(Array4::<f32>::zeros((3, 64, 7, 7)).into_dyn());
        assert_eq!(out.shape(), &[3, 3136]);
        let back = flatten.backward(out);
        assert_eq!(back.shape(), &[3, 64, 7, 7]);
    }
}
