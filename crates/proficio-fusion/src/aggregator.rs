//! Weighted-sum aggregation
//!
//! `fused = Σ_i w_i · gated_i` over the present views. The output width is
//! H no matter how many views contributed.

use ndarray::{Array1, ArrayView1};
use proficio_core::{FusionError, FusionResult};
use proficio_nn::ensure_finite;

/// Weighted sum of gated features; holds no parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FusionAggregator {
    hidden_dim: usize,
}

/// Gradients of `aggregate` with respect to its inputs
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateGradient {
    /// One row per input feature: `w_i · dfused`
    pub features: Vec<Array1<f32>>,
    /// `dfused · feature_i` for each weight
    pub weights: Vec<f32>,
}

impl FusionAggregator {
    pub fn new(hidden_dim: usize) -> Self {
        Self { hidden_dim }
    }

    /// Width of the fused output (H)
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// `Σ_i w_i · feature_i`, starting from zeros so a lone feature with
    /// weight 1 comes out unchanged
    pub fn aggregate(&self, features: &[Array1<f32>], weights: &[f32]) -> FusionResult<Array1<f32>> {
        if features.len() != weights.len() {
            return Err(FusionError::dimension(
                "aggregator weights",
                features.len(),
                weights.len(),
            ));
        }
        if features.is_empty() {
            return Err(FusionError::ViewCount {
                present: 0,
                slots: 0,
                max: 0,
            });
        }

        let mut fused = Array1::<f32>::zeros(self.hidden_dim);
        for (feature, &w) in features.iter().zip(weights) {
            if feature.len() != self.hidden_dim {
                return Err(FusionError::dimension(
                    "aggregator feature",
                    self.hidden_dim,
                    feature.len(),
                ));
            }
            fused.scaled_add(w, feature);
        }
        ensure_finite("aggregator", fused.iter())?;
        Ok(fused)
    }

    pub fn backward(
        &self,
        features: &[Array1<f32>],
        weights: &[f32],
        grad_fused: ArrayView1<f32>,
    ) -> FusionResult<AggregateGradient> {
        if features.len() != weights.len() {
            return Err(FusionError::dimension(
                "aggregator weights",
                features.len(),
                weights.len(),
            ));
        }
        if grad_fused.len() != self.hidden_dim {
            return Err(FusionError::dimension(
                "aggregator gradient",
                self.hidden_dim,
                grad_fused.len(),
            ));
        }
        Ok(AggregateGradient {
            features: weights.iter().map(|&w| grad_fused.mapv(|g| g * w)).collect(),
            weights: features.iter().map(|f| grad_fused.dot(f)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_weighted_sum() {
        let agg = FusionAggregator::new(2);
        let fused = agg
            .aggregate(&[array![1.0, 0.0], array![0.0, 4.0]], &[0.25, 0.75])
            .unwrap();
        assert_eq!(fused, array![0.25, 3.0]);
    }

    #[test]
    fn test_single_feature_passes_through_exactly() {
        let agg = FusionAggregator::new(3);
        let feature = array![0.123_456_7, -9.87, 1e-7];
        let fused = agg.aggregate(&[feature.clone()], &[1.0]).unwrap();
        assert_eq!(fused, feature);
    }

    #[test]
    fn test_backward() {
        let agg = FusionAggregator::new(2);
        let grad = agg
            .backward(&[array![1.0, 0.0], array![0.0, 4.0]], &[0.25, 0.75], array![2.0, -1.0].view())
            .unwrap();
        assert_eq!(grad.weights, vec![2.0, -4.0]);
        assert_eq!(grad.features, vec![array![0.5, -0.25], array![1.5, -0.75]]);
        assert!(agg.backward(&[], &[], array![1.0].view()).is_err());
    }

    #[test]
    fn test_shape_errors() {
        let agg = FusionAggregator::new(2);
        assert!(agg.aggregate(&[array![1.0, 2.0]], &[0.5, 0.5]).is_err());
        assert!(agg.aggregate(&[array![1.0, 2.0, 3.0]], &[1.0]).is_err());
        assert!(agg.aggregate(&[], &[]).is_err());
    }
}
