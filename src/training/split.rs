use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::info;

use crate::{data::align::AlignedBatch, error::DeepStockError};

/// Train and test partitions of one aligned batch.
#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    pub train: AlignedBatch,
    pub test: AlignedBatch,
}

/**
Shuffle sample indices with a seeded RNG and hold out a test partition.

## Arguments
* `batch` - The aligned modalities.
* `test_size` - Fraction of samples to hold out, in `(0, 1)`.
* `seed` - Makes the permutation reproducible.

## Returns
`ceil(n * test_size)` test samples and the rest for training. Both partitions
must be non-empty, otherwise `InsufficientData`.
 */
pub fn train_test_split(
    batch: &AlignedBatch,
    test_size: f64,
    seed: u64,
) -> Result<TrainTestSplit, DeepStockError> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(DeepStockError::ConfigError(format!(
            "test-size must be in (0, 1), got {}",
            test_size
        )));
    }
    let n = batch.len();
    let n_test = (n as f64 * test_size).ceil() as usize;
    if n_test == 0 || n_test >= n {
        return Err(DeepStockError::InsufficientData {
            got: n,
            required: 2,
            context: format!("cannot hold out {} of {} samples for testing", n_test, n),
        });
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let (test_idx, train_idx) = indices.split_at(n_test);

    info!("Split {} samples into {} train and {} test", n, train_idx.len(), test_idx.len());
    Ok(TrainTestSplit {
        train: batch.select(train_idx),
        test: batch.select(test_idx),
    })
}
