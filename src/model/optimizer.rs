use ndarray::{ArrayD, Zip};

use crate::{error::DeepStockError, model::layers::Trainable};

/// Adam with bias-corrected step size.
///
/// Moment buffers are matched to parameters by visiting order, which is fixed
/// for a given model.
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    t: i32,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }

    /// Applies one update from the gradients currently stored in `model`.
    ///
    /// A gradient whose shape differs from its parameter aborts the step with
    /// `ShapeMismatch`. Parameters visited before it have already moved.
    pub fn step(&mut self, model: &mut dyn Trainable) -> Result<(), DeepStockError> {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.learning_rate * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));
        let (ms, vs) = (&mut self.m, &mut self.v);
        let mut index = 0;
        let mut mismatch = None;

        model.visit_params(&mut |param, grad| {
            if mismatch.is_some() {
                return;
            }
            if index == ms.len() {
                ms.push(ArrayD::zeros(param.raw_dim()));
                vs.push(ArrayD::zeros(param.raw_dim()));
            }
            if grad.shape() != param.shape() || ms[index].shape() != param.shape() {
                mismatch = Some(DeepStockError::ShapeMismatch {
                    context: format!("gradient of parameter {}", index),
                    expected: param.shape().to_vec(),
                    actual: grad.shape().to_vec(),
                });
                return;
            }
            Zip::from(param)
                .and(&grad)
                .and(&mut ms[index])
                .and(&mut vs[index])
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + eps);
                });
            index += 1;
        });

        match mismatch {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, ArrayViewD, ArrayViewMutD};

    // f(w) = sum((w - target)^2)
    struct Quadratic {
        w: Array1<f64>,
        grad: Array1<f64>,
        target: Array1<f64>,
    }

    impl Quadratic {
        fn compute_grad(&mut self) {
            self.grad = (&self.w - &self.target) * 2.0;
        }
    }

    impl Trainable for Quadratic {
        fn visit_params(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
            f(self.w.view_mut().into_dyn(), self.grad.view().into_dyn());
        }

        fn zero_grad(&mut self) {
            self.grad.fill(0.0);
        }
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut q = Quadratic {
            w: Array1::from_vec(vec![1.0, -1.0]),
            grad: Array1::zeros(2),
            target: Array1::zeros(2),
        };
        q.compute_grad();
        let mut adam = Adam::new(0.1);
        adam.step(&mut q).unwrap();
        // The first bias-corrected step has magnitude ~lr in each coordinate.
        assert_abs_diff_eq!(q.w[0], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(q.w[1], -0.9, epsilon = 1e-6);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_converges_on_quadratic() {
        let mut q = Quadratic {
            w: Array1::from_vec(vec![3.0, -2.0, 0.5]),
            grad: Array1::zeros(3),
            target: Array1::from_vec(vec![1.0, 1.0, -1.0]),
        };
        let mut adam = Adam::new(0.05);
        for _ in 0..2000 {
            q.compute_grad();
            adam.step(&mut q).unwrap();
        }
        for (w, t) in q.w.iter().zip(q.target.iter()) {
            assert_abs_diff_eq!(*w, *t, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_mismatched_gradient_aborts_the_step() {
        let mut q = Quadratic {
            w: Array1::from_vec(vec![1.0, 2.0]),
            grad: Array1::zeros(3),
            target: Array1::zeros(2),
        };
        let mut adam = Adam::new(0.1);
        match adam.step(&mut q) {
            Err(DeepStockError::ShapeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, vec![2]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
        assert_eq!(q.w, Array1::from_vec(vec![1.0, 2.0]));
    }
}
