//! Seeded parameter initialisation
//!
//! Callers always pass the rng. Identical seeds give identical weights.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Deterministic rng for a given seed
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Glorot/Xavier normal initialisation for a `[fan_in, fan_out]` matrix
pub fn xavier_normal<R: Rng + ?Sized>(rng: &mut R, fan_in: usize, fan_out: usize) -> Array2<f32> {
    let std = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    normal_matrix(rng, fan_in, fan_out, std)
}

/// Zero-mean normal matrix with the given standard deviation
pub fn normal_matrix<R: Rng + ?Sized>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    std: f32,
) -> Array2<f32> {
    match Normal::new(0.0f32, std) {
        Ok(normal) => Array2::from_shape_fn((rows, cols), |_| normal.sample(rng)),
        // Only a non-finite std fails; fall back to zeros
        Err(_) => Array2::zeros((rows, cols)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_weights() {
        let a = xavier_normal(&mut seeded_rng(7), 16, 8);
        let b = xavier_normal(&mut seeded_rng(7), 16, 8);
        let c = xavier_normal(&mut seeded_rng(8), 16, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.shape(), &[16, 8]);
    }

    #[test]
    fn test_xavier_scale() {
        let w = xavier_normal(&mut seeded_rng(1), 256, 256);
        let n = w.len() as f32;
        let mean = w.sum() / n;
        let var = w.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n;
        // Target variance 2 / 512
        assert!(mean.abs() < 0.01);
        assert!((var - 2.0 / 512.0).abs() < 0.001);
    }
}
