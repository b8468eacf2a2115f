use ndarray::{concatenate, s, Array1, Array2, Array3, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ImageSize, ModelConfig},
    data::window::MinMaxScaler,
    error::{DeepStockError, Layer},
    model::{
        encoder::{ImageEncoder, ModalityEncoder, ScalarEncoder, SequenceEncoder},
        layers::{Activation, Dense, Trainable},
    },
};

/**
Concatenates `[image, sequence, scalar]` embeddings, in that order, and
regresses them onto one linear output unit.

The dense weights are order sensitive, so the concatenation order is part of
a trained model's contract.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionHead {
    dense: Dense,
    widths: [usize; 3],
}

impl FusionHead {
    pub fn new(widths: [usize; 3], rng: &mut StdRng) -> Self {
        Self {
            dense: Dense::new(widths.iter().sum(), 1, Activation::Linear, rng),
            widths,
        }
    }

    fn concat(&self, embeddings: [&Array2<f64>; 3]) -> Result<Array2<f64>, DeepStockError> {
        for (embedding, &width) in embeddings.iter().zip(self.widths.iter()) {
            if embedding.ncols() != width {
                return Err(DeepStockError::ShapeMismatch {
                    context: "fusion embedding".to_string(),
                    expected: vec![width],
                    actual: vec![embedding.ncols()],
                });
            }
        }
        Ok(concatenate(
            Axis(1),
            &[embeddings[0].view(), embeddings[1].view(), embeddings[2].view()],
        )?)
    }

    pub fn forward(&mut self, embeddings: [&Array2<f64>; 3]) -> Result<Array1<f64>, DeepStockError> {
        let fused = self.concat(embeddings)?;
        Ok(self.dense.forward(&fused).column(0).to_owned())
    }

    pub fn infer(&self, embeddings: [&Array2<f64>; 3]) -> Result<Array1<f64>, DeepStockError> {
        let fused = self.concat(embeddings)?;
        Ok(self.dense.infer(&fused).column(0).to_owned())
    }

    /// Splits the gradient of the fused vector back into per-branch gradients.
    pub fn backward(&mut self, grad: &Array1<f64>) -> Result<[Array2<f64>; 3], DeepStockError> {
        let grad = grad.view().insert_axis(Axis(1)).to_owned();
        let fused = self.dense.backward(&grad).map_err(|e| match e {
            DeepStockError::MissingForwardCache(_) => DeepStockError::MissingForwardCache(Layer::Fusion),
            other => other,
        })?;
        let [a, b, _] = self.widths;
        Ok([
            fused.slice(s![.., ..a]).to_owned(),
            fused.slice(s![.., a..a + b]).to_owned(),
            fused.slice(s![.., a + b..]).to_owned(),
        ])
    }
}

impl Trainable for FusionHead {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.dense.visit_params(f);
    }

    fn zero_grad(&mut self) {
        self.dense.zero_grad();
    }
}

/// The three encoders wired into one fusion head.
///
/// The close-price scaler used to build the training targets travels with
/// the model so predictions can be mapped back to prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridModel {
    image: ImageEncoder,
    sequence: SequenceEncoder,
    scalar: ScalarEncoder,
    head: FusionHead,
    config: ModelConfig,
    scaler: Option<MinMaxScaler>,
}

impl HybridModel {
    /**
    Build a freshly initialised model.

    ## Arguments
    * `config` - Layer widths, kernel size and dropout rate.
    * `image_size` - Height and width of the chart batch.
    * `timesteps` - Window length of the price sequences.
    * `seed` - Seeds weight initialisation and dropout masks.
     */
    pub fn new(
        config: &ModelConfig,
        image_size: ImageSize,
        timesteps: usize,
        seed: u64,
    ) -> Result<Self, DeepStockError> {
        if timesteps == 0 {
            return Err(DeepStockError::ConfigError(
                "a sequence encoder needs at least one timestep".to_string(),
            ));
        }
        if config.cnn_kernel_size == 0 {
            return Err(DeepStockError::ConfigError(
                "cnn-kernel-size must be greater than 0".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let image = ImageEncoder::new(config, image_size, seed, &mut rng);
        let sequence = SequenceEncoder::new(config, timesteps, &mut rng);
        let scalar = ScalarEncoder::new(config, &mut rng);
        let widths = [image.output_width(), sequence.output_width(), scalar.output_width()];
        let head = FusionHead::new(widths, &mut rng);

        let mut model = Self {
            image,
            sequence,
            scalar,
            head,
            config: config.clone(),
            scaler: None,
        };
        debug!("Built hybrid model with {} parameters", model.param_count());
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn scaler(&self) -> Option<&MinMaxScaler> {
        self.scaler.as_ref()
    }

    pub fn set_scaler(&mut self, scaler: MinMaxScaler) {
        self.scaler = Some(scaler);
    }

    /// Per-sample input shapes `[image, sequence, sentiment]`.
    pub fn input_shapes(&self) -> [Vec<usize>; 3] {
        [
            self.image.sample_shape(),
            self.sequence.sample_shape(),
            self.scalar.sample_shape(),
        ]
    }

    fn check_batch(
        images: &Array4<f64>,
        sequences: &Array3<f64>,
        sentiments: &Array2<f64>,
    ) -> Result<(), DeepStockError> {
        let lengths = [images.dim().0, sequences.dim().0, sentiments.nrows()];
        if lengths.iter().any(|&l| l != lengths[0]) {
            return Err(DeepStockError::ShapeMismatch {
                context: "modality batch sizes".to_string(),
                expected: vec![lengths[0]; 3],
                actual: lengths.to_vec(),
            });
        }
        Ok(())
    }

    /// Training-mode forward pass: dropout is active and caches are kept.
    pub fn forward(
        &mut self,
        images: &Array4<f64>,
        sequences: &Array3<f64>,
        sentiments: &Array2<f64>,
    ) -> Result<Array1<f64>, DeepStockError> {
        Self::check_batch(images, sequences, sentiments)?;
        let image = self.image.forward(images)?;
        let sequence = self.sequence.forward(sequences)?;
        let scalar = self.scalar.forward(sentiments)?;
        self.head.forward([&image, &sequence, &scalar])
    }

    pub fn backward(&mut self, grad: &Array1<f64>) -> Result<(), DeepStockError> {
        let [image, sequence, scalar] = self.head.backward(grad)?;
        self.image.backward(&image)?;
        self.sequence.backward(&sequence)?;
        self.scalar.backward(&scalar)?;
        Ok(())
    }

    /// Inference-mode prediction of scaled targets. Dropout is the identity.
    pub fn predict(
        &self,
        images: &Array4<f64>,
        sequences: &Array3<f64>,
        sentiments: &Array2<f64>,
    ) -> Result<Array1<f64>, DeepStockError> {
        Self::check_batch(images, sequences, sentiments)?;
        let image = self.image.infer(images)?;
        let sequence = self.sequence.infer(sequences)?;
        let scalar = self.scalar.infer(sentiments)?;
        self.head.infer([&image, &sequence, &scalar])
    }
}

impl Trainable for HybridModel {
    fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.image.visit_params(f);
        self.sequence.visit_params(f);
        self.scalar.visit_params(f);
        self.head.visit_params(f);
    }

    fn zero_grad(&mut self) {
        self.image.zero_grad();
        self.sequence.zero_grad();
        self.scalar.zero_grad();
        self.head.zero_grad();
    }
}
