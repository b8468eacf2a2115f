use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::DeepStockError, util::math_utils::min_max};

/// Min-max scaler onto `[0, 1]`, fitted once on the full close column.
///
/// A constant column has zero range. Like the usual convention, the range is
/// then treated as 1 so every value maps to 0 and the transform stays invertible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    data_min: f64,
    data_max: f64,
}

impl MinMaxScaler {
    pub fn fit(values: &[f64]) -> Result<Self, DeepStockError> {
        let (data_min, data_max) = min_max(values).ok_or(DeepStockError::InsufficientData {
            got: 0,
            required: 1,
            context: "cannot fit a scaler on an empty column".to_string(),
        })?;
        Ok(Self { data_min, data_max })
    }

    pub fn data_min(&self) -> f64 {
        self.data_min
    }

    pub fn data_max(&self) -> f64 {
        self.data_max
    }

    fn range(&self) -> f64 {
        let range = self.data_max - self.data_min;
        if range == 0.0 {
            1.0
        } else {
            range
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.data_min) / self.range()
    }

    pub fn inverse_transform(&self, scaled: f64) -> f64 {
        scaled * self.range() + self.data_min
    }

    pub fn transform_vec(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|&v| self.transform(v)).collect()
    }

    pub fn inverse_transform_vec(&self, scaled: &[f64]) -> Vec<f64> {
        scaled.iter().map(|&v| self.inverse_transform(v)).collect()
    }
}

/// Sliding windows of scaled closes and the scaled value that follows each one.
#[derive(Debug, Clone)]
pub struct WindowSeries {
    /// `(N - W, W, 1)`
    pub sequences: Array3<f64>,
    /// `(N - W)`, `targets[k]` is the scaled close at index `W + k`.
    pub targets: Array1<f64>,
    pub scaler: MinMaxScaler,
    pub window_size: usize,
}

impl WindowSeries {
    /**
    Build windows for every end index `i` in `W..N`.

    ## Arguments
    * `column` - The raw close column, chronologically ordered.
    * `window_size` - Window length `W`, must satisfy `0 < W < N`.

    ## Returns
    Exactly `N - W` windows and targets, or `InsufficientData` when `W >= N`.
     */
    pub fn build(column: &[f64], window_size: usize) -> Result<Self, DeepStockError> {
        if window_size == 0 {
            return Err(DeepStockError::ConfigError(
                "window size must be greater than 0".to_string(),
            ));
        }
        let n = column.len();
        if window_size >= n {
            return Err(DeepStockError::InsufficientData {
                got: n,
                required: window_size + 1,
                context: format!("window size {} needs a longer series", window_size),
            });
        }

        let scaler = MinMaxScaler::fit(column)?;
        let scaled = scaler.transform_vec(column);
        let count = n - window_size;

        let sequences =
            Array3::from_shape_fn((count, window_size, 1), |(k, t, _)| scaled[k + t]);
        let targets = Array1::from_shape_fn(count, |k| scaled[k + window_size]);

        debug!(
            "Built {} windows of length {} (scaler range [{}, {}])",
            count,
            window_size,
            scaler.data_min(),
            scaler.data_max()
        );

        Ok(Self {
            sequences,
            targets,
            scaler,
            window_size,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::s;

    #[test]
    fn test_window_counts() {
        for (n, w) in [(2, 1), (10, 3), (50, 30), (31, 30)] {
            let column: Vec<f64> = (0..n).map(|i| (i as f64 * 0.7).sin() + 5.0).collect();
            let series = WindowSeries::build(&column, w).unwrap();
            assert_eq!(series.sequences.dim(), (n - w, w, 1));
            assert_eq!(series.targets.len(), n - w);
        }
    }

    #[test]
    fn test_target_is_next_scaled_value() {
        let column = vec![10.0, 12.0, 11.0, 15.0, 20.0, 18.0, 14.0];
        let w = 3;
        let series = WindowSeries::build(&column, w).unwrap();
        let scaled = series.scaler.transform_vec(&column);
        for k in 0..series.len() {
            assert_abs_diff_eq!(series.targets[k], scaled[w + k], epsilon = 1e-12);
            let window: Vec<f64> = series.sequences.slice(s![k, .., 0]).to_vec();
            assert_eq!(window, scaled[k..k + w].to_vec());
        }
    }

    #[test]
    fn test_scaled_values_are_bounded() {
        let column = vec![3.0, -2.0, 8.0, 1.5, 4.0];
        let series = WindowSeries::build(&column, 2).unwrap();
        assert!(series.sequences.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(series.targets.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_insufficient_data() {
        let column = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            WindowSeries::build(&column, 3),
            Err(DeepStockError::InsufficientData { .. })
        ));
        assert!(matches!(
            WindowSeries::build(&column, 5),
            Err(DeepStockError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_scaler_round_trip() {
        let column = vec![101.3, 99.8, 120.4, 87.1, 110.0];
        let scaler = MinMaxScaler::fit(&column).unwrap();
        for x in [87.1, 95.0, 100.55, 120.4] {
            assert_abs_diff_eq!(scaler.inverse_transform(scaler.transform(x)), x, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_constant_column_scales_to_zero() {
        let column = vec![42.0; 50];
        let series = WindowSeries::build(&column, 30).unwrap();
        assert_eq!(series.len(), 20);
        assert!(series.targets.iter().all(|&v| v == 0.0));
        assert_abs_diff_eq!(series.scaler.inverse_transform(0.0), 42.0);
    }

    #[test]
    fn test_deterministic() {
        let column: Vec<f64> = (0..40).map(|i| (i * i % 17) as f64).collect();
        let a = WindowSeries::build(&column, 7).unwrap();
        let b = WindowSeries::build(&column, 7).unwrap();
        assert_eq!(a.sequences, b.sequences);
        assert_eq!(a.targets, b.targets);
    }
}
