use std::fmt;

use ndarray::Array1;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    config::TrainingConfig,
    data::align::AlignedBatch,
    error::DeepStockError,
    model::{fusion::HybridModel, layers::Trainable, optimizer::Adam},
    util::math_utils::{mean_absolute_error, mean_squared_error},
};

/// Loss (MSE) and MAE of one epoch, in scaled units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub mae: f64,
    pub val_loss: Option<f64>,
    pub val_mae: Option<f64>,
}

impl fmt::Display for EpochMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}: loss {:.6}, mae {:.6}", self.epoch, self.loss, self.mae)?;
        if let (Some(val_loss), Some(val_mae)) = (self.val_loss, self.val_mae) {
            write!(f, ", val_loss {:.6}, val_mae {:.6}", val_loss, val_mae)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// Test-set metrics in scaled units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub mae: f64,
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test loss (MSE): {:.6}, Test MAE: {:.6}", self.loss, self.mae)
    }
}

/// Mini-batch Adam training of a [`HybridModel`] on MSE.
#[derive(Debug)]
pub struct Trainer {
    config: TrainingConfig,
    optimizer: Adam,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            config: config.clone(),
            optimizer: Adam::new(config.learning_rate),
            rng: StdRng::seed_from_u64(config.random_state),
        }
    }

    /**
    Fit `model` on `train`.

    The last `validation-split` fraction of `train` is held out in its given
    order and scored after every epoch. The remaining samples are reshuffled
    each epoch and visited in mini-batches of `batch-size`.

    ## Returns
    Per-epoch metrics, or `InsufficientData` when nothing is left to fit on.
     */
    #[instrument(skip_all, fields(samples = train.len(), epochs = self.config.epochs))]
    pub fn fit(
        &mut self,
        model: &mut HybridModel,
        train: &AlignedBatch,
    ) -> Result<TrainingHistory, DeepStockError> {
        let n = train.len();
        let n_fit = (n as f64 * (1.0 - self.config.validation_split)).floor() as usize;
        if n_fit == 0 {
            return Err(DeepStockError::InsufficientData {
                got: n,
                required: 2,
                context: "no samples left for fitting after the validation split".to_string(),
            });
        }
        let (fit_set, val_set) = train.split_at(n_fit);
        info!(
            "Training on {} samples, validating on {} samples",
            fit_set.len(),
            val_set.len()
        );

        let batch_size = self.config.batch_size.max(1);
        let mut order: Vec<usize> = (0..fit_set.len()).collect();
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.epochs {
            order.shuffle(&mut self.rng);
            let mut squared = 0.0;
            let mut absolute = 0.0;

            for chunk in order.chunks(batch_size) {
                let batch = fit_set.select(chunk);
                let (sq, abs) = self.train_step(model, &batch)?;
                squared += sq;
                absolute += abs;
            }

            let (val_loss, val_mae) = if val_set.is_empty() {
                (None, None)
            } else {
                let eval = score(model, &val_set)?;
                (Some(eval.loss), Some(eval.mae))
            };
            let metrics = EpochMetrics {
                epoch,
                loss: squared / fit_set.len() as f64,
                mae: absolute / fit_set.len() as f64,
                val_loss,
                val_mae,
            };
            debug!("{}", metrics);
            history.epochs.push(metrics);
        }

        if let Some(last) = history.last() {
            info!(
                "Finished training after {} ({} optimizer steps)",
                last,
                self.optimizer.steps()
            );
        }
        Ok(history)
    }

    // Returns the summed squared and absolute errors of the batch.
    fn train_step(
        &mut self,
        model: &mut HybridModel,
        batch: &AlignedBatch,
    ) -> Result<(f64, f64), DeepStockError> {
        model.zero_grad();
        let predictions = model.forward(&batch.images, &batch.sequences, &batch.sentiments)?;
        let errors: Array1<f64> = &predictions - &batch.targets;
        let grad = &errors * (2.0 / batch.len() as f64);
        model.backward(&grad)?;
        self.optimizer.step(model)?;
        Ok((
            errors.iter().map(|e| e * e).sum(),
            errors.iter().map(|e| e.abs()).sum(),
        ))
    }

    /**
    Score `model` on a held-out test set.

    Each modality of `test` must have the per-sample shape the model was
    built for, otherwise `ShapeMismatch` names the offending modality.
     */
    #[instrument(skip_all, fields(samples = test.len()))]
    pub fn evaluate(&self, model: &HybridModel, test: &AlignedBatch) -> Result<Evaluation, DeepStockError> {
        let names = ["test images", "test sequences", "test sentiments"];
        for ((name, expected), actual) in names
            .iter()
            .zip(model.input_shapes())
            .zip(test.sample_shapes())
        {
            if expected != actual {
                return Err(DeepStockError::ShapeMismatch {
                    context: name.to_string(),
                    expected,
                    actual,
                });
            }
        }
        if test.is_empty() {
            return Err(DeepStockError::InsufficientData {
                got: 0,
                required: 1,
                context: "test set is empty".to_string(),
            });
        }
        let evaluation = score(model, test)?;
        info!("{}", evaluation);
        Ok(evaluation)
    }
}

fn score(model: &HybridModel, batch: &AlignedBatch) -> Result<Evaluation, DeepStockError> {
    let predictions = model.predict(&batch.images, &batch.sequences, &batch.sentiments)?;
    Ok(Evaluation {
        loss: mean_squared_error(&predictions, &batch.targets),
        mae: mean_absolute_error(&predictions, &batch.targets),
    })
}
