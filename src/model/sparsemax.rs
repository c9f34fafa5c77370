//! Sparsemax: Euclidean projection of each row onto the probability simplex.
//!
//! The threshold `tau` solving `sum(max(z - tau, 0)) = 1` is bracketed in
//! `[max(z) - 1, max(z)]` and located by bisection on detached values.
//! The bracket only decides the support; `tau` itself is recomputed from
//! the support in closed form on the live tensor so gradients follow the
//! exact sparsemax Jacobian.

use burn::prelude::*;
use burn::tensor::activation::relu;

const BISECTION_STEPS: usize = 40;

/// Row-wise sparsemax over dimension 1
pub fn sparsemax<B: Backend>(z: Tensor<B, 2>) -> Tensor<B, 2> {
    let frozen = z.clone().detach();

    let mut hi = frozen.clone().max_dim(1);
    let mut lo = hi.clone().sub_scalar(1.0);

    for _ in 0..BISECTION_STEPS {
        let mid = (lo.clone() + hi.clone()).div_scalar(2.0);
        let mass = relu(frozen.clone() - mid.clone()).sum_dim(1);
        // mass > 1 means mid is still below tau
        let below = mass.greater_elem(1.0).float();
        let above = below.clone().neg().add_scalar(1.0);
        lo = lo.clone() + (mid.clone() - lo) * below;
        hi = hi.clone() - (hi - mid) * above;
    }

    let support = (frozen - lo).greater_elem(0.0).float();
    let size = support.clone().sum_dim(1).clamp_min(1.0);
    let tau = ((z.clone() * support).sum_dim(1).sub_scalar(1.0)) / size;

    relu(z - tau)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::to_host;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn run(values: Vec<f32>, n_cols: usize) -> Vec<f32> {
        let device = Default::default();
        let n_rows = values.len() / n_cols;
        let z = Tensor::<TestBackend, 2>::from_data(TensorData::new(values, [n_rows, n_cols]), &device);
        to_host(sparsemax(z))
    }

    #[test]
    fn test_rows_sum_to_one() {
        let out = run(vec![0.1, 0.5, -0.3, 2.0, 0.0, 0.0, 0.0, 0.0, 0.3, 0.3, 0.3, 0.3], 4);
        for row in out.chunks(4) {
            assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-4);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn test_known_projection() {
        // z = [1.0, 0.5, -1.0]: support {0, 1}, tau = 0.25
        let out = run(vec![1.0, 0.5, -1.0], 3);
        assert_abs_diff_eq!(out[0], 0.75, epsilon = 1e-4);
        assert_abs_diff_eq!(out[1], 0.25, epsilon = 1e-4);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_dominant_entry_takes_all_mass() {
        let out = run(vec![5.0, 0.0, 1.0], 3);
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-5);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_uniform_row() {
        let out = run(vec![0.0; 4], 4);
        for p in out {
            assert_abs_diff_eq!(p, 0.25, epsilon = 1e-4);
        }
    }
}
