//! Inverted dropout with a caller-supplied rng

use ndarray::Array1;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self {
            rate: rate.clamp(0.0, 0.999),
        }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Per-element multiplier: `1 / (1 - rate)` with probability
    /// `1 - rate`, else 0. A zero rate yields ones and draws nothing.
    pub fn sample_mask<R: Rng + ?Sized>(&self, len: usize, rng: &mut R) -> Array1<f32> {
        if self.rate == 0.0 {
            return Array1::ones(len);
        }
        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        Array1::from_shape_fn(len, |_| if rng.gen::<f32>() < keep { scale } else { 0.0 })
    }

    /// Zero each element with probability `rate`, scale survivors by
    /// `1 / (1 - rate)`. Returns the mask for the backward pass.
    pub fn apply<R: Rng + ?Sized>(&self, x: &mut Array1<f32>, rng: &mut R) -> Array1<f32> {
        let mask = self.sample_mask(x.len(), rng);
        *x *= &mask;
        mask
    }

    /// Gradient through a forward pass that used `mask`
    pub fn backward(mask: &Array1<f32>, grad_out: &Array1<f32>) -> Array1<f32> {
        grad_out * mask
    }
}
