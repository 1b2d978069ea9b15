//! Layer normalization
//!
//! ```text
//! y = gamma * (x - mean) / sqrt(var + eps) + beta
//! ```

use ndarray::{Array1, ArrayView1};
use proficio_core::{FusionError, FusionResult};

use crate::{param_name, GradientStore, NamedTensor, Parameterized, TensorStore};

#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    /// gamma = 1, beta = 0
    pub fn new(dim: usize, eps: f32) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            eps,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    /// `(x - mean) / std` and `1 / std`
    fn normalize(&self, x: ArrayView1<f32>) -> FusionResult<(Array1<f32>, f32)> {
        let dim = self.dim();
        if x.len() != dim {
            return Err(FusionError::dimension("layer norm input", dim, x.len()));
        }

        let n = dim as f32;
        let mean = x.sum() / n;
        let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + self.eps).sqrt();
        Ok((x.mapv(|v| (v - mean) * inv_std), inv_std))
    }

    pub fn forward(&self, x: ArrayView1<f32>) -> FusionResult<Array1<f32>> {
        let (normed, _) = self.normalize(x)?;
        Ok(normed * &self.gamma + &self.beta)
    }

    /// Gradient with respect to `x`; adds `dgamma` and `dbeta` under `prefix`
    ///
    /// ```text
    /// dx = inv_std / n * (n·dx̂ - Σdx̂ - x̂·Σ(dx̂·x̂))      dx̂ = g·gamma
    /// ```
    pub fn backward(
        &self,
        x: ArrayView1<f32>,
        grad_out: ArrayView1<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        let (normed, inv_std) = self.normalize(x)?;
        if grad_out.len() != self.dim() {
            return Err(FusionError::dimension(
                "layer norm output gradient",
                self.dim(),
                grad_out.len(),
            ));
        }

        grads.accumulate_array1(param_name(prefix, "gamma"), &(&grad_out * &normed));
        grads.accumulate_array1(param_name(prefix, "beta"), &grad_out.to_owned());

        let n = self.dim() as f32;
        let d_normed = &grad_out * &self.gamma;
        let sum = d_normed.sum();
        let dot = d_normed.dot(&normed);
        Ok((d_normed * n - sum - normed * dot) * (inv_std / n))
    }
}

impl Parameterized for LayerNorm {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        out.push(NamedTensor::from_array1(param_name(prefix, "gamma"), &self.gamma, true));
        out.push(NamedTensor::from_array1(param_name(prefix, "beta"), &self.beta, true));
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        store.load_array1(&param_name(prefix, "gamma"), &mut self.gamma)?;
        store.load_array1(&param_name(prefix, "beta"), &mut self.beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_normalizes() {
        let norm = LayerNorm::new(4, 1e-5);
        let y = norm.forward(array![1.0, 2.0, 3.0, 4.0].view()).unwrap();
        let mean = y.sum() / 4.0;
        let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_constant_input_is_finite() {
        let norm = LayerNorm::new(3, 1e-5);
        let y = norm.forward(array![5.0, 5.0, 5.0].view()).unwrap();
        assert!(y.iter().all(|v| v.is_finite() && v.abs() < 1e-6));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut norm = LayerNorm::new(4, 1e-5);
        norm.gamma = array![1.5, 0.5, -1.0, 2.0];
        norm.beta = array![0.1, 0.0, -0.2, 0.3];
        let x = array![0.4, -1.1, 2.3, 0.9];
        let g = array![0.7, -1.3, 0.2, 1.1];
        let loss = |x: &Array1<f32>| norm.forward(x.view()).unwrap().dot(&g);

        let mut grads = GradientStore::new();
        let dx = norm.backward(x.view(), g.view(), "norm", &mut grads).unwrap();

        let eps = 1e-2;
        for i in 0..4 {
            let mut hi = x.clone();
            let mut lo = x.clone();
            hi[i] += eps;
            lo[i] -= eps;
            let numeric = (loss(&hi) - loss(&lo)) / (2.0 * eps);
            assert!((numeric - dx[i]).abs() < 5e-3, "dx[{}]: {} vs {}", i, numeric, dx[i]);
        }
        // a shift of the input leaves the output unchanged
        assert!(dx.sum().abs() < 1e-5);
        assert_eq!(grads.get("norm.beta").unwrap().data, g.to_vec());
        assert_eq!(grads.get("norm.gamma").unwrap().shape, vec![4]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let norm = LayerNorm::new(3, 1e-5);
        assert!(norm.forward(array![1.0].view()).is_err());
    }
}
