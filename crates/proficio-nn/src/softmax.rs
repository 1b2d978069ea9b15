//! Softmax with an explicit presence mask
//!
//! Masked positions are set to negative infinity before normalization so
//! they come out as exactly zero and never contribute to the maximum.

use proficio_core::{FusionError, FusionResult};

/// In-place softmax over all positions
pub fn softmax_inplace(scores: &mut [f32]) {
    if scores.is_empty() {
        return;
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    for s in scores.iter_mut() {
        *s /= sum;
    }
}

/// In-place softmax restricted to `mask[i] == true`
///
/// Fails with `ViewCount` when nothing is unmasked: an all-masked row has
/// no valid normalization.
pub fn masked_softmax_inplace(scores: &mut [f32], mask: &[bool]) -> FusionResult<()> {
    if scores.len() != mask.len() {
        return Err(FusionError::dimension("softmax mask", scores.len(), mask.len()));
    }
    if !mask.iter().any(|&m| m) {
        return Err(FusionError::ViewCount {
            present: 0,
            slots: mask.len(),
            max: mask.len(),
        });
    }

    for (s, &m) in scores.iter_mut().zip(mask) {
        if !m {
            *s = f32::NEG_INFINITY;
        }
    }

    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (s, &m) in scores.iter_mut().zip(mask) {
        *s = if m { (*s - max).exp() } else { 0.0 };
        sum += *s;
    }
    for s in scores.iter_mut() {
        *s /= sum;
    }
    Ok(())
}

/// Gradient of the scores given softmax output `probs` and the gradient of
/// that output: `p_i · (g_i - Σ_j p_j g_j)`
pub fn softmax_backward(probs: &[f32], grad_out: &[f32]) -> FusionResult<Vec<f32>> {
    if probs.len() != grad_out.len() {
        return Err(FusionError::dimension("softmax gradient", probs.len(), grad_out.len()));
    }
    let dot: f32 = probs.iter().zip(grad_out).map(|(p, g)| p * g).sum();
    Ok(probs.iter().zip(grad_out).map(|(p, g)| p * (g - dot)).collect())
}

/// As `softmax_backward`, with masked positions pinned to exactly zero
/// whatever their incoming gradient holds
pub fn masked_softmax_backward(
    probs: &[f32],
    grad_out: &[f32],
    mask: &[bool],
) -> FusionResult<Vec<f32>> {
    if probs.len() != mask.len() || grad_out.len() != mask.len() {
        return Err(FusionError::dimension("softmax mask", mask.len(), probs.len()));
    }
    let dot: f32 = probs
        .iter()
        .zip(grad_out)
        .zip(mask)
        .filter(|(_, &m)| m)
        .map(|((p, g), _)| p * g)
        .sum();
    Ok(probs
        .iter()
        .zip(grad_out)
        .zip(mask)
        .map(|((p, g), &m)| if m { p * (g - dot) } else { 0.0 })
        .collect())
}

/// `ln(sum(exp(x)))` without overflow
pub fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_masked_positions_are_zero() {
        let mut scores = vec![1.0, 100.0, 2.0];
        masked_softmax_inplace(&mut scores, &[true, false, true]).unwrap();
        assert_eq!(scores[1], 0.0);
        assert!((scores[0] + scores[2] - 1.0).abs() < 1e-6);
        assert!(scores[2] > scores[0]);
    }

    #[test]
    fn test_masked_ignores_non_finite_masked_scores() {
        let mut scores = vec![f32::NAN, 0.5, f32::INFINITY];
        masked_softmax_inplace(&mut scores, &[false, true, false]).unwrap();
        assert_eq!(scores, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_all_masked_is_error() {
        let mut scores = vec![1.0, 2.0];
        assert!(matches!(
            masked_softmax_inplace(&mut scores, &[false, false]),
            Err(FusionError::ViewCount { present: 0, .. })
        ));
    }

    #[test]
    fn test_single_position_is_exactly_one() {
        let mut scores = vec![-3.7];
        softmax_inplace(&mut scores);
        assert_eq!(scores, vec![1.0]);
    }

    #[test]
    fn test_log_sum_exp_large_values() {
        let lse = log_sum_exp(&[1000.0, 1000.0]);
        assert!((lse - (1000.0 + 2.0f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let scores = [0.3f32, -1.0, 0.8, 0.1];
        let g = [1.0f32, 0.5, -2.0, 0.25];
        let loss = |s: &[f32]| {
            let mut p = s.to_vec();
            softmax_inplace(&mut p);
            p.iter().zip(&g).map(|(p, g)| p * g).sum::<f32>()
        };

        let mut probs = scores.to_vec();
        softmax_inplace(&mut probs);
        let grad = softmax_backward(&probs, &g).unwrap();

        let eps = 1e-2;
        for i in 0..scores.len() {
            let mut hi = scores;
            let mut lo = scores;
            hi[i] += eps;
            lo[i] -= eps;
            let numeric = (loss(&hi) - loss(&lo)) / (2.0 * eps);
            assert!((numeric - grad[i]).abs() < 1e-3);
        }
        assert!(grad.iter().sum::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_masked_backward_is_zero_on_masked() {
        let mask = [true, false, true];
        let mut probs = vec![0.2, 5.0, -0.4];
        masked_softmax_inplace(&mut probs, &mask).unwrap();
        let grad = masked_softmax_backward(&probs, &[1.0, f32::NAN, -1.0], &mask).unwrap();
        assert_eq!(grad[1], 0.0);
        assert!(grad[0].is_finite() && grad[2].is_finite());
        assert!((grad[0] + grad[2]).abs() < 1e-6);

        let dense = softmax_backward(&[probs[0], probs[2]], &[1.0, -1.0]).unwrap();
        assert_eq!(vec![grad[0], grad[2]], dense);
    }

    proptest! {
        #[test]
        fn prop_masked_softmax_is_simplex(
            scores in prop::collection::vec(-50.0f32..50.0, 1..8),
            seed in any::<u8>(),
        ) {
            let mut mask: Vec<bool> = (0..scores.len()).map(|i| (seed >> (i % 8)) & 1 == 1).collect();
            mask[0] = true;
            let mut s = scores.clone();
            masked_softmax_inplace(&mut s, &mask).unwrap();
            let sum: f32 = s.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-5);
            for (v, m) in s.iter().zip(&mask) {
                prop_assert!(*v >= 0.0);
                if !m {
                    prop_assert_eq!(*v, 0.0);
                }
            }
        }
    }
}
