//! Affine layer `y = x·W + b`

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use proficio_core::{FusionError, FusionResult};
use rand::Rng;

use crate::{param_name, xavier_normal, GradientStore, NamedTensor, Parameterized, TensorStore};

/// Dense layer with weight `[in_dim, out_dim]`
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
    trainable: bool,
}

impl Linear {
    /// Xavier-initialised weight, zero bias
    pub fn new<R: Rng + ?Sized>(rng: &mut R, in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: xavier_normal(rng, in_dim, out_dim),
            bias: Array1::zeros(out_dim),
            trainable: true,
        }
    }

    /// All-zero layer; used as a shape template before loading a checkpoint
    pub fn zeros(in_dim: usize, out_dim: usize) -> Self {
        Self {
            weight: Array2::zeros((in_dim, out_dim)),
            bias: Array1::zeros(out_dim),
            trainable: true,
        }
    }

    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>) -> FusionResult<Self> {
        if weight.ncols() != bias.len() {
            return Err(FusionError::dimension("linear bias", weight.ncols(), bias.len()));
        }
        Ok(Self {
            weight,
            bias,
            trainable: true,
        })
    }

    /// Mark the layer as a frozen base
    pub fn freeze(&mut self) {
        self.trainable = false;
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    pub fn forward(&self, x: ArrayView1<f32>) -> FusionResult<Array1<f32>> {
        if x.len() != self.in_dim() {
            return Err(FusionError::dimension("linear input", self.in_dim(), x.len()));
        }
        Ok(x.dot(&self.weight) + &self.bias)
    }

    /// Row-wise forward over `[rows, in_dim]`
    pub fn forward_rows(&self, x: ArrayView2<f32>) -> FusionResult<Array2<f32>> {
        if x.ncols() != self.in_dim() {
            return Err(FusionError::dimension("linear input", self.in_dim(), x.ncols()));
        }
        Ok(x.dot(&self.weight) + &self.bias)
    }

    /// Gradient with respect to `x` given the gradient of the output.
    ///
    /// `dW += x ⊗ g` and `db += g` are added under `prefix` unless the
    /// layer is frozen.
    pub fn backward(
        &self,
        x: ArrayView1<f32>,
        grad_out: ArrayView1<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        if x.len() != self.in_dim() {
            return Err(FusionError::dimension("linear input", self.in_dim(), x.len()));
        }
        if grad_out.len() != self.out_dim() {
            return Err(FusionError::dimension(
                "linear output gradient",
                self.out_dim(),
                grad_out.len(),
            ));
        }
        if self.trainable {
            grads.accumulate_outer(param_name(prefix, "weight"), x, grad_out);
            grads.accumulate_array1(param_name(prefix, "bias"), &grad_out.to_owned());
        }
        Ok(self.weight.dot(&grad_out))
    }
}

impl Parameterized for Linear {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        out.push(NamedTensor::from_array2(
            param_name(prefix, "weight"),
            &self.weight,
            self.trainable,
        ));
        out.push(NamedTensor::from_array1(
            param_name(prefix, "bias"),
            &self.bias,
            self.trainable,
        ));
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        store.load_array2(&param_name(prefix, "weight"), &mut self.weight)?;
        store.load_array1(&param_name(prefix, "bias"), &mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeded_rng;
    use ndarray::array;

    #[test]
    fn test_forward() {
        let layer = Linear::from_parts(array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]], array![0.5, -0.5])
            .unwrap();
        let y = layer.forward(array![1.0, 2.0, 3.0].view()).unwrap();
        assert_eq!(y, array![4.5, 6.5]);
    }

    #[test]
    fn test_forward_rows_matches_forward() {
        let layer = Linear::new(&mut seeded_rng(3), 5, 4);
        let rows = array![[0.1, 0.2, 0.3, 0.4, 0.5], [-1.0, 0.0, 1.0, 0.0, -1.0]];
        let batched = layer.forward_rows(rows.view()).unwrap();
        for (i, row) in rows.rows().into_iter().enumerate() {
            let single = layer.forward(row).unwrap();
            for (a, b) in batched.row(i).iter().zip(single.iter()) {
                assert!((a - b).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let layer = Linear::zeros(3, 2);
        assert!(matches!(
            layer.forward(array![1.0, 2.0].view()),
            Err(FusionError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let layer = Linear::new(&mut seeded_rng(5), 4, 3);
        let x = array![0.3, -1.2, 0.7, 0.05];
        let g = array![1.0, -0.5, 2.0];
        let loss = |layer: &Linear, x: &Array1<f32>| layer.forward(x.view()).unwrap().dot(&g);

        let mut grads = GradientStore::new();
        let dx = layer.backward(x.view(), g.view(), "fc", &mut grads).unwrap();

        let eps = 1e-2;
        for i in 0..4 {
            let mut hi = x.clone();
            let mut lo = x.clone();
            hi[i] += eps;
            lo[i] -= eps;
            let numeric = (loss(&layer, &hi) - loss(&layer, &lo)) / (2.0 * eps);
            assert!((numeric - dx[i]).abs() < 1e-3, "dx[{}]: {} vs {}", i, numeric, dx[i]);
        }

        let dw = grads.get("fc.weight").unwrap();
        assert_eq!(dw.shape, vec![4, 3]);
        // row-major: [1, 2] is element 5
        assert_eq!(dw.data[5], x[1] * g[2]);
        assert_eq!(grads.get("fc.bias").unwrap().data, g.to_vec());
    }

    #[test]
    fn test_frozen_layer_records_no_gradient() {
        let mut layer = Linear::new(&mut seeded_rng(6), 2, 2);
        layer.freeze();
        let mut grads = GradientStore::new();
        let dx = layer
            .backward(array![1.0, 1.0].view(), array![1.0, 0.0].view(), "base", &mut grads)
            .unwrap();
        assert!(grads.is_empty());
        assert_eq!(dx, layer.weight().column(0).to_owned());
    }

    #[test]
    fn test_parameters_roundtrip() {
        let source = Linear::new(&mut seeded_rng(11), 4, 3);
        let mut tensors = Vec::new();
        source.collect_parameters("proj", &mut tensors);
        assert_eq!(tensors[0].name, "proj.weight");
        assert_eq!(tensors[1].name, "proj.bias");

        let mut target = Linear::zeros(4, 3);
        target
            .load_parameters("proj", &TensorStore::from_tensors(tensors))
            .unwrap();
        assert_eq!(target, source);
    }
}
