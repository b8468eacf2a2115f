use ndarray::{ArrayBase, Data, Dimension, Zip};

/**
Mean squared error between predictions and targets of the same shape.

## Returns
The mean of the squared element-wise differences, or `f64::NAN` if the arrays are empty.
 */
pub fn mean_squared_error<S1, S2, D>(predictions: &ArrayBase<S1, D>, targets: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    mean_of(predictions, targets, |d| d * d)
}

/**
Mean absolute error between predictions and targets of the same shape.

## Returns
The mean of the absolute element-wise differences, or `f64::NAN` if the arrays are empty.
 */
pub fn mean_absolute_error<S1, S2, D>(predictions: &ArrayBase<S1, D>, targets: &ArrayBase<S2, D>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    mean_of(predictions, targets, f64::abs)
}

fn mean_of<S1, S2, D>(
    predictions: &ArrayBase<S1, D>,
    targets: &ArrayBase<S2, D>,
    f: impl Fn(f64) -> f64,
) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    if predictions.is_empty() {
        return f64::NAN;
    }
    let mut total = 0.0;
    Zip::from(predictions)
        .and(targets)
        .for_each(|&p, &t| total += f(p - t));
    total / predictions.len() as f64
}

/// Smallest and largest value, `None` when empty.
pub fn min_max<'a, I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = &'a f64>,
{
    values.into_iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
