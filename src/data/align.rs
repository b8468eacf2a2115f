use ndarray::{s, Array1, Array2, Array3, Array4, Axis};
use tracing::{debug, warn};

use crate::error::DeepStockError;

/// Equal-length views of every modality, ready for splitting.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedBatch {
    /// `(n, H, W, 3)`
    pub images: Array4<f64>,
    /// `(n, W, 1)`
    pub sequences: Array3<f64>,
    /// `(n, 1)`
    pub sentiments: Array2<f64>,
    /// `(n)`
    pub targets: Array1<f64>,
}

impl AlignedBatch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Samples at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> AlignedBatch {
        AlignedBatch {
            images: self.images.select(Axis(0), indices),
            sequences: self.sequences.select(Axis(0), indices),
            sentiments: self.sentiments.select(Axis(0), indices),
            targets: self.targets.select(Axis(0), indices),
        }
    }

    /// Splits into `[0, at)` and `[at, len)` without reordering.
    pub fn split_at(&self, at: usize) -> (AlignedBatch, AlignedBatch) {
        let at = at.min(self.len());
        let head: Vec<usize> = (0..at).collect();
        let tail: Vec<usize> = (at..self.len()).collect();
        (self.select(&head), self.select(&tail))
    }

    /// Per-sample shapes `[image, sequence, sentiment]`, without the batch axis.
    pub fn sample_shapes(&self) -> [Vec<usize>; 3] {
        [
            self.images.shape()[1..].to_vec(),
            self.sequences.shape()[1..].to_vec(),
            self.sentiments.shape()[1..].to_vec(),
        ]
    }
}

/**
Truncate every modality to the shortest one, keeping leading elements.

Alignment is positional: element `k` of each input is assumed to describe the
same sample. A skipped image earlier in the pipeline shifts every later chart by
one, which truncation alone cannot detect.

## Returns
An [`AlignedBatch`] of length `min(len)`, or `EmptyAlignment` when that is 0.
 */
pub fn align(
    images: &Array4<f64>,
    sequences: &Array3<f64>,
    sentiments: &Array2<f64>,
    targets: &Array1<f64>,
) -> Result<AlignedBatch, DeepStockError> {
    let lengths = [
        images.dim().0,
        sequences.dim().0,
        sentiments.dim().0,
        targets.len(),
    ];
    let n = lengths.iter().copied().min().unwrap_or(0);
    if n == 0 {
        return Err(DeepStockError::EmptyAlignment { lengths });
    }
    if lengths.iter().any(|&l| l != n) {
        warn!(
            "Modality lengths differ (images, sequences, sentiments, targets) = {:?}; truncating to {}",
            lengths, n
        );
    } else {
        debug!("All modalities have {} samples", n);
    }

    Ok(AlignedBatch {
        images: images.slice(s![..n, .., .., ..]).to_owned(),
        sequences: sequences.slice(s![..n, .., ..]).to_owned(),
        sentiments: sentiments.slice(s![..n, ..]).to_owned(),
        targets: targets.slice(s![..n]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(lengths: [usize; 4]) -> (Array4<f64>, Array3<f64>, Array2<f64>, Array1<f64>) {
        (
            Array4::from_shape_fn((lengths[0], 2, 2, 3), |(i, _, _, _)| i as f64),
            Array3::from_shape_fn((lengths[1], 4, 1), |(i, _, _)| i as f64),
            Array2::from_shape_fn((lengths[2], 1), |(i, _)| i as f64),
            Array1::from_shape_fn(lengths[3], |i| i as f64),
        )
    }

    #[test]
    fn test_truncates_to_shortest_prefix() {
        let (img, seq, sent, tgt) = inputs([7, 5, 9, 5]);
        let batch = align(&img, &seq, &sent, &tgt).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.images.dim(), (5, 2, 2, 3));
        assert_eq!(batch.sequences.dim(), (5, 4, 1));
        assert_eq!(batch.sentiments.dim(), (5, 1));
        // Leading elements are kept.
        assert_eq!(batch.images[[4, 0, 0, 0]], 4.0);
        assert_eq!(batch.sentiments[[4, 0]], 4.0);
        assert_eq!(batch.targets, Array1::from_vec(vec![0.0, 1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_aligning_twice_changes_nothing() {
        let (img, seq, sent, tgt) = inputs([6, 8, 6, 7]);
        let once = align(&img, &seq, &sent, &tgt).unwrap();
        let twice = align(&once.images, &once.sequences, &once.sentiments, &once.targets).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_modality_is_an_error() {
        let (img, seq, sent, tgt) = inputs([0, 3, 3, 3]);
        match align(&img, &seq, &sent, &tgt) {
            Err(DeepStockError::EmptyAlignment { lengths }) => assert_eq!(lengths, [0, 3, 3, 3]),
            other => panic!("expected EmptyAlignment, got {:?}", other),
        }
    }
}
