use ndarray::{Array2, Array3, Array4, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    config::{ImageSize, ModelConfig},
    error::DeepStockError,
    model::layers::{Activation, Conv2d, Dense, Dropout, Lstm, Trainable},
    util::math_utils::min_max,
};

/// Maps one modality's batch to a `(batch, width)` embedding.
///
/// `forward` runs in training mode and keeps what `backward` needs.
/// `infer` is the side-effect free inference path.
pub trait ModalityEncoder: Trainable {
    type Input;

    fn output_width(&self) -> usize;

    /// Expected shape of one sample, without the batch axis.
    fn sample_shape(&self) -> Vec<usize>;

    fn forward(&mut self, input: &Self::Input) -> Result<Array2<f64>, DeepStockError>;

    fn infer(&self, input: &Self::Input) -> Result<Array2<f64>, DeepStockError>;

    fn backward(&mut self, grad: &Array2<f64>) -> Result<(), DeepStockError>;
}

fn check_sample_shape(context: &str, expected: &[usize], shape: &[usize]) -> Result<(), DeepStockError> {
    if shape.len() != expected.len() + 1 || &shape[1..] != expected {
        return Err(DeepStockError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: shape.get(1..).map(|s| s.to_vec()).unwrap_or_default(),
        });
    }
    Ok(())
}

/// Two same-padding convolutions, flatten, dense projection, dropout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEncoder {
    conv1: Conv2d,
    conv2: Conv2d,
    dense: Dense,
    dropout: Dropout,
    size: ImageSize,
}

impl ImageEncoder {
    pub fn new(config: &ModelConfig, size: ImageSize, seed: u64, rng: &mut StdRng) -> Self {
        let [f1, f2] = config.cnn_filters;
        let k = config.cnn_kernel_size;
        let flat = size.height as usize * size.width as usize * f2;
        Self {
            conv1: Conv2d::new(3, f1, k, rng),
            conv2: Conv2d::new(f1, f2, k, rng),
            dense: Dense::new(flat, config.dense_units.image, Activation::Relu, rng),
            dropout: Dropout::new(config.dropout_rate, seed),
            size,
        }
    }

    fn validate(&self, images: &Array4<f64>) -> Result<(), DeepStockError> {
        check_sample_shape("image batch", &self.sample_shape(), images.shape())?;
        if images.iter().all(|v| (0.0..=1.0).contains(v)) {
            return Ok(());
        }
        // NaN pixels are reported as a NaN range.
        let (min, max) = if images.iter().any(|v| v.is_nan()) {
            (f64::NAN, f64::NAN)
        } else {
            min_max(images.iter()).unwrap_or((f64::NAN, f64::NAN))
        };
        Err(DeepStockError::InvalidInputRange { min, max })
    }

    fn flatten(maps: &Array4<f64>) -> Result<Array2<f64>, DeepStockError> {
        let (b, h, w, c) = maps.dim();
        Ok(Array2::from_shape_vec((b, h * w * c), maps.iter().copied().collect())?)
    }

    fn unflatten(&self, grad: &Array2<f64>) -> Result<Array4<f64>, DeepStockError> {
        let (h, w) = (self.size.height as usize, self.size.width as usize);
        let shape = (grad.nrows(), h, w, self.conv2.filters());
        Ok(Array4::from_shape_vec(shape, grad.iter().copied().collect())?)
    }
}

impl ModalityEncoder for ImageEncoder {
    type Input = Array4<f64>;

    fn output_width(&self) -> usize {
        self.dense.units()
    }

    fn sample_shape(&self) -> Vec<usize> {
        vec![self.size.height as usize, self.size.width as usize, 3]
    }

    fn forward(&mut self, images: &Array4<f64>) -> Result<Array2<f64>, DeepStockError> {
        self.validate(images)?;
        let maps = self.conv1.forward(images)?;
        let maps = self.conv2.forward(&maps)?;
        let embedded = self.dense.forward(&Self::flatten(&maps)?);
        Ok(self.dropout.forward(&embedded))
    }

    fn infer(&self, images: &Array4<f64>) -> Result<Array2<f64>, DeepStockError> {
        self.validate(images)?;
        let maps = self.conv2.infer(&self.conv1.infer(images)?)?;
        let embedded = self.dense.infer(&Self::flatten(&maps)?);
        Ok(self.dropout.infer(&embedded))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<(), DeepStockError> {
        let grad = self.dropout.backward(grad);
        let grad = self.dense.backward(&grad)?;
        let grad = self.conv2.backward(&self.unflatten(&grad)?)?;
        self.conv1.backward(&grad)?;
        Ok(())
    }
}

impl Trainable for ImageEncoder {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.conv1.visit_params(f);
        self.conv2.visit_params(f);
        self.dense.visit_params(f);
    }

    fn zero_grad(&mut self) {
        self.conv1.zero_grad();
        self.conv2.zero_grad();
        self.dense.zero_grad();
    }
}

/// Two stacked LSTMs (full sequence, then final state) and a dense projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEncoder {
    first: Lstm,
    second: Lstm,
    dense: Dense,
    timesteps: usize,
}

impl SequenceEncoder {
    pub fn new(config: &ModelConfig, timesteps: usize, rng: &mut StdRng) -> Self {
        let [u1, u2] = config.lstm_units;
        Self {
            first: Lstm::new(1, u1, rng),
            second: Lstm::new(u1, u2, rng),
            dense: Dense::new(u2, config.dense_units.sequence, Activation::Relu, rng),
            timesteps,
        }
    }
}

impl ModalityEncoder for SequenceEncoder {
    type Input = Array3<f64>;

    fn output_width(&self) -> usize {
        self.dense.units()
    }

    fn sample_shape(&self) -> Vec<usize> {
        vec![self.timesteps, 1]
    }

    fn forward(&mut self, sequences: &Array3<f64>) -> Result<Array2<f64>, DeepStockError> {
        check_sample_shape("sequence batch", &self.sample_shape(), sequences.shape())?;
        let hidden = self.first.forward_sequence(sequences);
        let last = self.second.forward_final(&hidden);
        Ok(self.dense.forward(&last))
    }

    fn infer(&self, sequences: &Array3<f64>) -> Result<Array2<f64>, DeepStockError> {
        check_sample_shape("sequence batch", &self.sample_shape(), sequences.shape())?;
        let hidden = self.first.infer_sequence(sequences);
        Ok(self.dense.infer(&self.second.infer_final(&hidden)))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<(), DeepStockError> {
        let grad = self.dense.backward(grad)?;
        let grad = self.second.backward_final(&grad)?;
        self.first.backward_sequence(&grad)?;
        Ok(())
    }
}

impl Trainable for SequenceEncoder {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.first.visit_params(f);
        self.second.visit_params(f);
        self.dense.visit_params(f);
    }

    fn zero_grad(&mut self) {
        self.first.zero_grad();
        self.second.zero_grad();
        self.dense.zero_grad();
    }
}

/// Single ReLU projection of the `(batch, 1)` sentiment column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarEncoder {
    dense: Dense,
}

impl ScalarEncoder {
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Self {
        Self {
            dense: Dense::new(1, config.dense_units.sentiment, Activation::Relu, rng),
        }
    }
}

impl ModalityEncoder for ScalarEncoder {
    type Input = Array2<f64>;

    fn output_width(&self) -> usize {
        self.dense.units()
    }

    fn sample_shape(&self) -> Vec<usize> {
        vec![1]
    }

    fn forward(&mut self, scalars: &Array2<f64>) -> Result<Array2<f64>, DeepStockError> {
        check_sample_shape("sentiment batch", &self.sample_shape(), scalars.shape())?;
        Ok(self.dense.forward(scalars))
    }

    fn infer(&self, scalars: &Array2<f64>) -> Result<Array2<f64>, DeepStockError> {
        check_sample_shape("sentiment batch", &self.sample_shape(), scalars.shape())?;
        Ok(self.dense.infer(scalars))
    }

    fn backward(&mut self, grad: &Array2<f64>) -> Result<(), DeepStockError> {
        self.dense.backward(grad)?;
        Ok(())
    }
}

impl Trainable for ScalarEncoder {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.dense.visit_params(f);
    }

    fn zero_grad(&mut self) {
        self.dense.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DenseUnits;
    use rand::SeedableRng;

    fn tiny_config(dropout_rate: f64) -> ModelConfig {
        ModelConfig {
            cnn_filters: [2, 3],
            cnn_kernel_size: 3,
            lstm_units: [4, 3],
            dense_units: DenseUnits {
                image: 5,
                sequence: 4,
                sentiment: 2,
            },
            dropout_rate,
        }
    }

    fn images(n: usize) -> Array4<f64> {
        Array4::from_shape_fn((n, 6, 5, 3), |(b, i, j, c)| ((b + i + 2 * j + c) % 7) as f64 / 7.0)
    }

    #[test]
    fn test_image_encoder_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut encoder = ImageEncoder::new(&tiny_config(0.5), ImageSize::new(6, 5), 1, &mut rng);
        let out = encoder.forward(&images(3)).unwrap();
        assert_eq!(out.dim(), (3, 5));
        assert_eq!(encoder.output_width(), 5);
        encoder.backward(&Array2::ones((3, 5))).unwrap();
    }

    #[test]
    fn test_image_range_is_validated() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = ImageEncoder::new(&tiny_config(0.0), ImageSize::new(6, 5), 1, &mut rng);
        let mut batch = images(2);
        batch[[1, 2, 2, 0]] = 255.0;
        assert!(matches!(
            encoder.infer(&batch),
            Err(DeepStockError::InvalidInputRange { max, .. }) if max == 255.0
        ));
        batch[[1, 2, 2, 0]] = -0.1;
        assert!(matches!(
            encoder.infer(&batch),
            Err(DeepStockError::InvalidInputRange { .. })
        ));
    }

    #[test]
    fn test_nan_pixel_is_out_of_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut encoder = ImageEncoder::new(&tiny_config(0.0), ImageSize::new(6, 5), 1, &mut rng);
        let mut batch = images(1);
        batch[[0, 1, 1, 0]] = f64::NAN;
        assert!(matches!(
            encoder.infer(&batch),
            Err(DeepStockError::InvalidInputRange { min, max }) if min.is_nan() && max.is_nan()
        ));
        assert!(matches!(
            encoder.forward(&batch),
            Err(DeepStockError::InvalidInputRange { .. })
        ));
    }

    #[test]
    fn test_image_shape_is_validated() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = ImageEncoder::new(&tiny_config(0.0), ImageSize::new(6, 5), 1, &mut rng);
        let wrong = Array4::zeros((2, 5, 6, 3));
        assert!(matches!(
            encoder.infer(&wrong),
            Err(DeepStockError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_image_inference_is_deterministic_training_is_not() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut encoder = ImageEncoder::new(&tiny_config(0.5), ImageSize::new(6, 5), 9, &mut rng);
        let batch = images(4);
        assert_eq!(encoder.infer(&batch).unwrap(), encoder.infer(&batch).unwrap());

        let outputs: Vec<Array2<f64>> = (0..5).map(|_| encoder.forward(&batch).unwrap()).collect();
        assert!(outputs.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn test_sequence_encoder() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut encoder = SequenceEncoder::new(&tiny_config(0.0), 7, &mut rng);
        let seqs = Array3::from_shape_fn((2, 7, 1), |(b, t, _)| (b * 7 + t) as f64 / 14.0);
        assert_eq!(encoder.forward(&seqs).unwrap().dim(), (2, 4));
        encoder.backward(&Array2::ones((2, 4))).unwrap();
        assert!(matches!(
            encoder.infer(&Array3::zeros((2, 6, 1))),
            Err(DeepStockError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_scalar_encoder() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = ScalarEncoder::new(&tiny_config(0.0), &mut rng);
        let out = encoder.infer(&Array2::from_elem((3, 1), 0.4)).unwrap();
        assert_eq!(out.dim(), (3, 2));
        assert!(out.iter().all(|&v| v >= 0.0));
    }
}
