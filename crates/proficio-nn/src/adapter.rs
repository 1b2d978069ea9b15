//! Low-rank adapter overlay
//!
//! A frozen base weight plus a trainable rank-`r` update:
//!
//! ```text
//! W_eff = W + (alpha / r) * A·B      A: [in, r], B: [r, out]
//! ```
//!
//! B starts at zero so a fresh overlay leaves the base layer unchanged.
//! Only A and B are reported as trainable.

use ndarray::{Array1, Array2, ArrayView1};
use proficio_core::{AdapterConfig, FusionError, FusionResult};
use rand::Rng;

use crate::{
    normal_matrix, param_name, GradientStore, Linear, NamedTensor, Parameterized, TensorStore,
};

/// Std of the A initialisation
const ADAPTER_A_STD: f32 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct LowRankAdapter {
    a: Array2<f32>,
    b: Array2<f32>,
    scale: f32,
}

impl LowRankAdapter {
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        in_dim: usize,
        out_dim: usize,
        config: AdapterConfig,
    ) -> Self {
        let rank = config.rank.max(1);
        Self {
            a: normal_matrix(rng, in_dim, rank, ADAPTER_A_STD),
            b: Array2::zeros((rank, out_dim)),
            scale: config.alpha / rank as f32,
        }
    }

    pub fn zeros(in_dim: usize, out_dim: usize, config: AdapterConfig) -> Self {
        let rank = config.rank.max(1);
        Self {
            a: Array2::zeros((in_dim, rank)),
            b: Array2::zeros((rank, out_dim)),
            scale: config.alpha / rank as f32,
        }
    }

    pub fn rank(&self) -> usize {
        self.a.ncols()
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// `scale * A·B`
    pub fn delta(&self) -> Array2<f32> {
        self.a.dot(&self.b) * self.scale
    }

    /// `scale * (x·A)·B`, without materialising the full update
    pub fn forward(&self, x: ArrayView1<f32>) -> Array1<f32> {
        x.dot(&self.a).dot(&self.b) * self.scale
    }
}

/// Frozen `Linear` with a low-rank overlay
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedLinear {
    base: Linear,
    adapter: LowRankAdapter,
}

impl AdaptedLinear {
    pub fn new(mut base: Linear, adapter: LowRankAdapter) -> FusionResult<Self> {
        if adapter.a.nrows() != base.in_dim() || adapter.b.ncols() != base.out_dim() {
            return Err(FusionError::dimension(
                "adapter shape",
                base.in_dim() * base.out_dim(),
                adapter.a.nrows() * adapter.b.ncols(),
            ));
        }
        base.freeze();
        Ok(Self { base, adapter })
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn adapter(&self) -> &LowRankAdapter {
        &self.adapter
    }

    pub fn in_dim(&self) -> usize {
        self.base.in_dim()
    }

    pub fn out_dim(&self) -> usize {
        self.base.out_dim()
    }

    /// `W + scale * A·B`
    pub fn effective_weight(&self) -> Array2<f32> {
        self.base.weight() + &self.adapter.delta()
    }

    pub fn forward(&self, x: ArrayView1<f32>) -> FusionResult<Array1<f32>> {
        let base = self.base.forward(x)?;
        Ok(base + &self.adapter.forward(x))
    }

    /// Gradient with respect to `x`. Only the overlay records parameter
    /// gradients:
    ///
    /// ```text
    /// u  = x·A
    /// dB += scale · u ⊗ g
    /// dA += x ⊗ (scale · B·g)
    /// ```
    pub fn backward(
        &self,
        x: ArrayView1<f32>,
        grad_out: ArrayView1<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        let dx_base = self
            .base
            .backward(x, grad_out, &param_name(prefix, "base"), grads)?;

        let u = x.dot(&self.adapter.a);
        let scaled = grad_out.mapv(|g| g * self.adapter.scale);
        grads.accumulate_outer(param_name(prefix, "adapter.b"), u.view(), scaled.view());
        let du = self.adapter.b.dot(&scaled);
        grads.accumulate_outer(param_name(prefix, "adapter.a"), x, du.view());

        Ok(dx_base + &self.adapter.a.dot(&du))
    }
}

impl Parameterized for AdaptedLinear {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.base.collect_parameters(&param_name(prefix, "base"), out);
        out.push(NamedTensor::from_array2(param_name(prefix, "adapter.a"), &self.adapter.a, true));
        out.push(NamedTensor::from_array2(param_name(prefix, "adapter.b"), &self.adapter.b, true));
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        self.base.load_parameters(&param_name(prefix, "base"), store)?;
        store.load_array2(&param_name(prefix, "adapter.a"), &mut self.adapter.a)?;
        store.load_array2(&param_name(prefix, "adapter.b"), &mut self.adapter.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seeded_rng;
    use ndarray::Array1;

    fn adapted(seed: u64) -> AdaptedLinear {
        let mut rng = seeded_rng(seed);
        let base = Linear::new(&mut rng, 6, 4);
        let adapter = LowRankAdapter::new(&mut rng, 6, 4, AdapterConfig { rank: 2, alpha: 4.0 });
        AdaptedLinear::new(base, adapter).unwrap()
    }

    #[test]
    fn test_fresh_adapter_is_identity_overlay() {
        let layer = adapted(1);
        assert_eq!(&layer.effective_weight(), layer.base().weight());
        assert_eq!(layer.adapter().scale(), 2.0);
    }

    #[test]
    fn test_forward_matches_effective_weight() {
        let mut layer = adapted(2);
        layer.adapter.b = normal_matrix(&mut seeded_rng(9), 2, 4, 0.5);

        let x = Array1::from_vec(vec![0.3, -0.2, 0.8, 0.0, 1.5, -1.0]);
        let direct = layer.forward(x.view()).unwrap();
        let via_weight = x.dot(&layer.effective_weight()) + layer.base().bias();
        for (a, b) in direct.iter().zip(via_weight.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert_ne!(&layer.effective_weight(), layer.base().weight());
    }

    #[test]
    fn test_only_overlay_is_trainable() {
        let layer = adapted(3);
        let summary = layer.parameter_summary();
        assert_eq!(summary.trainable, 6 * 2 + 2 * 4);
        assert_eq!(summary.total, 6 * 4 + 4 + 6 * 2 + 2 * 4);
    }

    #[test]
    fn test_backward_only_touches_overlay() {
        let mut layer = adapted(5);
        layer.adapter.b = normal_matrix(&mut seeded_rng(10), 2, 4, 0.5);
        let x = Array1::from_vec(vec![0.5, -0.3, 0.2, 1.0, -0.8, 0.1]);
        let g = Array1::from_vec(vec![1.0, -1.0, 0.5, 0.25]);

        let mut grads = GradientStore::new();
        let dx = layer.backward(x.view(), g.view(), "proj", &mut grads).unwrap();

        assert_eq!(grads.names().collect::<Vec<_>>(), vec!["proj.adapter.a", "proj.adapter.b"]);
        let expected = layer.effective_weight().dot(&g);
        for (a, b) in dx.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        // dL/dB[r, c] for L = g·y, checked by perturbing one entry
        let loss = |layer: &AdaptedLinear| layer.forward(x.view()).unwrap().dot(&g);
        let eps = 1e-2;
        let mut hi = layer.clone();
        let mut lo = layer.clone();
        hi.adapter.b[[1, 2]] += eps;
        lo.adapter.b[[1, 2]] -= eps;
        let numeric = (loss(&hi) - loss(&lo)) / (2.0 * eps);
        let analytic = grads.get("proj.adapter.b").unwrap().data[4 + 2];
        assert!((numeric - analytic).abs() < 1e-3, "{} vs {}", numeric, analytic);

        let mut hi = layer.clone();
        let mut lo = layer.clone();
        hi.adapter.a[[3, 0]] += eps;
        lo.adapter.a[[3, 0]] -= eps;
        let numeric = (loss(&hi) - loss(&lo)) / (2.0 * eps);
        let analytic = grads.get("proj.adapter.a").unwrap().data[3 * 2];
        assert!((numeric - analytic).abs() < 1e-3, "{} vs {}", numeric, analytic);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut rng = seeded_rng(4);
        let base = Linear::new(&mut rng, 6, 4);
        let adapter = LowRankAdapter::new(&mut rng, 5, 4, AdapterConfig { rank: 2, alpha: 1.0 });
        assert!(AdaptedLinear::new(base, adapter).is_err());
    }
}
