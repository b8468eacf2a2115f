use ndarray::{
    concatenate, s, Array, Array1, Array2, Array3, Array4, ArrayView3, ArrayViewD, ArrayViewMutD,
    Axis, Dimension,
};
use ndarray_rand::{rand_distr::Uniform, RandomExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DeepStockError, Layer};

/// Anything the optimizer can update.
pub trait Trainable {
    /// Calls `f(parameter, gradient)` for every parameter tensor, always in the same order.
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>));

    fn zero_grad(&mut self);

    fn param_count(&mut self) -> usize {
        let mut count = 0;
        self.visit_params(&mut |p, _| count += p.len());
        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Linear,
}

impl Activation {
    pub fn apply<D: Dimension>(&self, z: &Array<f64, D>) -> Array<f64, D> {
        match self {
            Activation::Relu => z.mapv(|v| v.max(0.0)),
            Activation::Linear => z.clone(),
        }
    }

    pub fn derivative<D: Dimension>(&self, z: &Array<f64, D>) -> Array<f64, D> {
        match self {
            Activation::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
            Activation::Linear => Array::ones(z.raw_dim()),
        }
    }
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

// Glorot/Xavier uniform.
fn glorot(fan_in: usize, fan_out: usize, shape: (usize, usize), rng: &mut StdRng) -> Array2<f64> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Array2::random_using(shape, Uniform::new(-limit, limit), rng)
}

/// Fully connected layer, `y = act(x W + b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: Array2<f64>,
    bias: Array1<f64>,
    activation: Activation,
    #[serde(skip)]
    grad_weights: Array2<f64>,
    #[serde(skip)]
    grad_bias: Array1<f64>,
    #[serde(skip)]
    cache: Option<(Array2<f64>, Array2<f64>)>,
}

impl Dense {
    pub fn new(input_size: usize, units: usize, activation: Activation, rng: &mut StdRng) -> Self {
        Self {
            weights: glorot(input_size, units, (input_size, units), rng),
            bias: Array1::zeros(units),
            activation,
            grad_weights: Array2::zeros((input_size, units)),
            grad_bias: Array1::zeros(units),
            cache: None,
        }
    }

    pub fn units(&self) -> usize {
        self.weights.ncols()
    }

    fn linear(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weights) + &self.bias
    }

    pub fn infer(&self, x: &Array2<f64>) -> Array2<f64> {
        self.activation.apply(&self.linear(x))
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        let z = self.linear(x);
        let out = self.activation.apply(&z);
        self.cache = Some((x.clone(), z));
        out
    }

    /// Stores parameter gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>, DeepStockError> {
        let (input, z) = self
            .cache
            .take()
            .ok_or(DeepStockError::MissingForwardCache(Layer::Dense))?;
        let delta = grad * &self.activation.derivative(&z);
        self.grad_weights = input.t().dot(&delta);
        self.grad_bias = delta.sum_axis(Axis(0));
        Ok(delta.dot(&self.weights.t()))
    }
}

impl Trainable for Dense {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        f(self.weights.view_mut().into_dyn(), self.grad_weights.view().into_dyn());
        f(self.bias.view_mut().into_dyn(), self.grad_bias.view().into_dyn());
    }

    fn zero_grad(&mut self) {
        self.grad_weights = Array2::zeros(self.weights.raw_dim());
        self.grad_bias = Array1::zeros(self.bias.raw_dim());
    }
}

/// Inverted dropout. Identity outside of training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dropout {
    rate: f64,
    seed: u64,
    #[serde(skip)]
    rng: Option<StdRng>,
    #[serde(skip)]
    mask: Option<Array2<f64>>,
}

impl Dropout {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate,
            seed,
            rng: None,
            mask: None,
        }
    }

    pub fn infer(&self, x: &Array2<f64>) -> Array2<f64> {
        x.clone()
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Array2<f64> {
        if self.rate <= 0.0 {
            self.mask = None;
            return x.clone();
        }
        let keep = 1.0 - self.rate;
        let rate = self.rate;
        let seed = self.seed;
        let rng = self.rng.get_or_insert_with(|| StdRng::seed_from_u64(seed));
        let mask = Array2::from_shape_fn(x.raw_dim(), |_| {
            if rng.gen::<f64>() < rate {
                0.0
            } else {
                1.0 / keep
            }
        });
        let out = x * &mask;
        self.mask = Some(mask);
        out
    }

    pub fn backward(&mut self, grad: &Array2<f64>) -> Array2<f64> {
        match self.mask.take() {
            Some(mask) => grad * &mask,
            None => grad.clone(),
        }
    }
}

/// 2D convolution over NHWC batches with stride 1, same padding and ReLU.
///
/// Weights are kept as a `(k * k * C, F)` matrix so each sample is one
/// im2col product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    weights: Array2<f64>,
    bias: Array1<f64>,
    kernel: usize,
    in_channels: usize,
    #[serde(skip)]
    grad_weights: Array2<f64>,
    #[serde(skip)]
    grad_bias: Array1<f64>,
    #[serde(skip)]
    cache: Option<(Array4<f64>, Array4<f64>)>,
}

impl Conv2d {
    pub fn new(in_channels: usize, filters: usize, kernel: usize, rng: &mut StdRng) -> Self {
        let rows = kernel * kernel * in_channels;
        Self {
            weights: glorot(rows, kernel * kernel * filters, (rows, filters), rng),
            bias: Array1::zeros(filters),
            kernel,
            in_channels,
            grad_weights: Array2::zeros((rows, filters)),
            grad_bias: Array1::zeros(filters),
            cache: None,
        }
    }

    pub fn filters(&self) -> usize {
        self.weights.ncols()
    }

    fn pad(&self) -> isize {
        ((self.kernel - 1) / 2) as isize
    }

    fn im2col(&self, x: ArrayView3<'_, f64>) -> Array2<f64> {
        let (h, w, c) = x.dim();
        let k = self.kernel;
        let pad = self.pad();
        let mut cols = Array2::zeros((h * w, k * k * c));
        for i in 0..h {
            for j in 0..w {
                let mut row = cols.row_mut(i * w + j);
                for di in 0..k {
                    let y = i as isize + di as isize - pad;
                    if y < 0 || y >= h as isize {
                        continue;
                    }
                    for dj in 0..k {
                        let xx = j as isize + dj as isize - pad;
                        if xx < 0 || xx >= w as isize {
                            continue;
                        }
                        let offset = (di * k + dj) * c;
                        row.slice_mut(s![offset..offset + c])
                            .assign(&x.slice(s![y as usize, xx as usize, ..]));
                    }
                }
            }
        }
        cols
    }

    fn col2im(&self, cols: &Array2<f64>, (h, w, c): (usize, usize, usize)) -> Array3<f64> {
        let k = self.kernel;
        let pad = self.pad();
        let mut out = Array3::zeros((h, w, c));
        for i in 0..h {
            for j in 0..w {
                let row = cols.row(i * w + j);
                for di in 0..k {
                    let y = i as isize + di as isize - pad;
                    if y < 0 || y >= h as isize {
                        continue;
                    }
                    for dj in 0..k {
                        let xx = j as isize + dj as isize - pad;
                        if xx < 0 || xx >= w as isize {
                            continue;
                        }
                        let offset = (di * k + dj) * c;
                        let mut target = out.slice_mut(s![y as usize, xx as usize, ..]);
                        target += &row.slice(s![offset..offset + c]);
                    }
                }
            }
        }
        out
    }

    fn pre_activation(&self, x: &Array4<f64>) -> Result<Array4<f64>, DeepStockError> {
        let (b, h, w, c) = x.dim();
        if c != self.in_channels {
            return Err(DeepStockError::ShapeMismatch {
                context: "conv2d input channels".to_string(),
                expected: vec![self.in_channels],
                actual: vec![c],
            });
        }
        let f = self.filters();
        let maps = (0..b)
            .into_par_iter()
            .map(|i| self.im2col(x.index_axis(Axis(0), i)).dot(&self.weights) + &self.bias)
            .collect::<Vec<Array2<f64>>>();
        let mut out = Array4::zeros((b, h, w, f));
        for (mut slot, map) in out.axis_iter_mut(Axis(0)).zip(maps) {
            slot.assign(&map.into_shape((h, w, f))?);
        }
        Ok(out)
    }

    pub fn infer(&self, x: &Array4<f64>) -> Result<Array4<f64>, DeepStockError> {
        Ok(Activation::Relu.apply(&self.pre_activation(x)?))
    }

    pub fn forward(&mut self, x: &Array4<f64>) -> Result<Array4<f64>, DeepStockError> {
        let z = self.pre_activation(x)?;
        let out = Activation::Relu.apply(&z);
        self.cache = Some((x.clone(), z));
        Ok(out)
    }

    pub fn backward(&mut self, grad: &Array4<f64>) -> Result<Array4<f64>, DeepStockError> {
        let (input, z) = self
            .cache
            .take()
            .ok_or(DeepStockError::MissingForwardCache(Layer::Conv2d))?;
        let delta = grad * &Activation::Relu.derivative(&z);
        let (b, h, w, c) = input.dim();
        let f = self.filters();

        // Patches are rebuilt here instead of being cached by the forward pass.
        let per_sample = (0..b)
            .into_par_iter()
            .map(|i| -> Result<(Array2<f64>, Array1<f64>, Array3<f64>), DeepStockError> {
                let d = Array2::from_shape_vec(
                    (h * w, f),
                    delta.index_axis(Axis(0), i).iter().copied().collect(),
                )?;
                let cols = self.im2col(input.index_axis(Axis(0), i));
                let dx = self.col2im(&d.dot(&self.weights.t()), (h, w, c));
                Ok((cols.t().dot(&d), d.sum_axis(Axis(0)), dx))
            })
            .collect::<Result<Vec<_>, DeepStockError>>()?;

        let mut grad_weights = Array2::zeros(self.weights.raw_dim());
        let mut grad_bias = Array1::zeros(f);
        let mut grad_input = Array4::zeros((b, h, w, c));
        for ((gw, gb, dx), mut slot) in per_sample.into_iter().zip(grad_input.axis_iter_mut(Axis(0))) {
            grad_weights += &gw;
            grad_bias += &gb;
            slot.assign(&dx);
        }
        self.grad_weights = grad_weights;
        self.grad_bias = grad_bias;
        Ok(grad_input)
    }
}

impl Trainable for Conv2d {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        f(self.weights.view_mut().into_dyn(), self.grad_weights.view().into_dyn());
        f(self.bias.view_mut().into_dyn(), self.grad_bias.view().into_dyn());
    }

    fn zero_grad(&mut self) {
        self.grad_weights = Array2::zeros(self.weights.raw_dim());
        self.grad_bias = Array1::zeros(self.bias.raw_dim());
    }
}

#[derive(Debug, Clone)]
struct LstmStep {
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    input: Array2<f64>,
    forget: Array2<f64>,
    candidate: Array2<f64>,
    output: Array2<f64>,
    cell: Array2<f64>,
}

/**
Long short-term memory layer over `(batch, timesteps, features)` input.

Gates are packed `[input, forget, candidate, output]` along the last axis of
the kernels. The forget bias starts at 1.

Both a full hidden-state sequence (`forward_sequence`) and the final state
(`forward_final`) are available, so stacked layers can feed each other.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lstm {
    kernel: Array2<f64>,
    recurrent: Array2<f64>,
    bias: Array1<f64>,
    #[serde(skip)]
    grad_kernel: Array2<f64>,
    #[serde(skip)]
    grad_recurrent: Array2<f64>,
    #[serde(skip)]
    grad_bias: Array1<f64>,
    #[serde(skip)]
    cache: Option<(Array3<f64>, Vec<LstmStep>)>,
}

impl Lstm {
    pub fn new(input_size: usize, units: usize, rng: &mut StdRng) -> Self {
        let mut bias = Array1::zeros(4 * units);
        bias.slice_mut(s![units..2 * units]).fill(1.0);
        Self {
            kernel: glorot(input_size, 4 * units, (input_size, 4 * units), rng),
            recurrent: glorot(units, 4 * units, (units, 4 * units), rng),
            bias,
            grad_kernel: Array2::zeros((input_size, 4 * units)),
            grad_recurrent: Array2::zeros((units, 4 * units)),
            grad_bias: Array1::zeros(4 * units),
            cache: None,
        }
    }

    pub fn units(&self) -> usize {
        self.recurrent.nrows()
    }

    fn run(&self, x: &Array3<f64>, keep_steps: bool) -> (Array3<f64>, Vec<LstmStep>) {
        let (b, t, _) = x.dim();
        let units = self.units();
        let mut h = Array2::zeros((b, units));
        let mut c = Array2::zeros((b, units));
        let mut hidden = Array3::zeros((b, t, units));
        let mut steps = Vec::with_capacity(if keep_steps { t } else { 0 });

        for step in 0..t {
            let x_t = x.index_axis(Axis(1), step);
            let z = x_t.dot(&self.kernel) + h.dot(&self.recurrent) + &self.bias;
            let input = z.slice(s![.., 0..units]).mapv(sigmoid);
            let forget = z.slice(s![.., units..2 * units]).mapv(sigmoid);
            let candidate = z.slice(s![.., 2 * units..3 * units]).mapv(f64::tanh);
            let output = z.slice(s![.., 3 * units..]).mapv(sigmoid);

            let cell = &forget * &c + &input * &candidate;
            let h_next = &output * &cell.mapv(f64::tanh);
            hidden.index_axis_mut(Axis(1), step).assign(&h_next);

            if keep_steps {
                steps.push(LstmStep {
                    h_prev: h,
                    c_prev: c,
                    input,
                    forget,
                    candidate,
                    output,
                    cell: cell.clone(),
                });
            }
            h = h_next;
            c = cell;
        }
        (hidden, steps)
    }

    pub fn infer_sequence(&self, x: &Array3<f64>) -> Array3<f64> {
        self.run(x, false).0
    }

    pub fn infer_final(&self, x: &Array3<f64>) -> Array2<f64> {
        last_step(&self.infer_sequence(x))
    }

    pub fn forward_sequence(&mut self, x: &Array3<f64>) -> Array3<f64> {
        let (hidden, steps) = self.run(x, true);
        self.cache = Some((x.clone(), steps));
        hidden
    }

    pub fn forward_final(&mut self, x: &Array3<f64>) -> Array2<f64> {
        last_step(&self.forward_sequence(x))
    }

    /// Backpropagation through time from a gradient on every hidden state.
    pub fn backward_sequence(&mut self, grad: &Array3<f64>) -> Result<Array3<f64>, DeepStockError> {
        let (inputs, steps) = self
            .cache
            .take()
            .ok_or(DeepStockError::MissingForwardCache(Layer::Lstm))?;
        let (b, t, features) = inputs.dim();
        let units = self.units();

        let mut grad_kernel = Array2::zeros(self.kernel.raw_dim());
        let mut grad_recurrent = Array2::zeros(self.recurrent.raw_dim());
        let mut grad_bias = Array1::zeros(self.bias.raw_dim());
        let mut grad_input = Array3::zeros((b, t, features));
        let mut dh_next = Array2::<f64>::zeros((b, units));
        let mut dc_next = Array2::<f64>::zeros((b, units));

        for (step, cached) in steps.iter().enumerate().rev() {
            let dh = &grad.index_axis(Axis(1), step) + &dh_next;
            let tanh_c = cached.cell.mapv(f64::tanh);
            let d_output = &dh * &tanh_c;
            let dc = &dh * &cached.output * &tanh_c.mapv(|v| 1.0 - v * v) + &dc_next;
            let d_input = &dc * &cached.candidate;
            let d_candidate = &dc * &cached.input;
            let d_forget = &dc * &cached.c_prev;
            dc_next = &dc * &cached.forget;

            let dz_input = d_input * &cached.input.mapv(|v| v * (1.0 - v));
            let dz_forget = d_forget * &cached.forget.mapv(|v| v * (1.0 - v));
            let dz_candidate = d_candidate * &cached.candidate.mapv(|v| 1.0 - v * v);
            let dz_output = d_output * &cached.output.mapv(|v| v * (1.0 - v));
            let dz = concatenate(
                Axis(1),
                &[dz_input.view(), dz_forget.view(), dz_candidate.view(), dz_output.view()],
            )?;

            let x_t = inputs.index_axis(Axis(1), step);
            grad_kernel += &x_t.t().dot(&dz);
            grad_recurrent += &cached.h_prev.t().dot(&dz);
            grad_bias += &dz.sum_axis(Axis(0));
            grad_input
                .index_axis_mut(Axis(1), step)
                .assign(&dz.dot(&self.kernel.t()));
            dh_next = dz.dot(&self.recurrent.t());
        }

        self.grad_kernel = grad_kernel;
        self.grad_recurrent = grad_recurrent;
        self.grad_bias = grad_bias;
        Ok(grad_input)
    }

    /// Backward pass when only the final hidden state was consumed.
    pub fn backward_final(&mut self, grad: &Array2<f64>) -> Result<Array3<f64>, DeepStockError> {
        let t = match &self.cache {
            Some((inputs, _)) => inputs.dim().1,
            None => return Err(DeepStockError::MissingForwardCache(Layer::Lstm)),
        };
        let (b, units) = grad.dim();
        let mut full = Array3::zeros((b, t, units));
        if t > 0 {
            full.index_axis_mut(Axis(1), t - 1).assign(grad);
        }
        self.backward_sequence(&full)
    }
}

fn last_step(hidden: &Array3<f64>) -> Array2<f64> {
    let (b, t, units) = hidden.dim();
    if t == 0 {
        return Array2::zeros((b, units));
    }
    hidden.index_axis(Axis(1), t - 1).to_owned()
}

impl Trainable for Lstm {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        f(self.kernel.view_mut().into_dyn(), self.grad_kernel.view().into_dyn());
        f(self.recurrent.view_mut().into_dyn(), self.grad_recurrent.view().into_dyn());
        f(self.bias.view_mut().into_dyn(), self.grad_bias.view().into_dyn());
    }

    fn zero_grad(&mut self) {
        self.grad_kernel = Array2::zeros(self.kernel.raw_dim());
        self.grad_recurrent = Array2::zeros(self.recurrent.raw_dim());
        self.grad_bias = Array1::zeros(self.bias.raw_dim());
    }
}
