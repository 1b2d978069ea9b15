//! Adaptive calibration
//!
//! Combines each present view's gate with the attention confidence it
//! receives, applies a temperature softmax over the present views and
//! renormalizes. The result always lies on the probability simplex.
//!
//! ```text
//! Product:  logit_i = ln(g_i + ε) + ln(c_i + ε)
//! Learned:  logit_i = α·g_i + β·c_i
//! w         = softmax(logit / T) / Σ
//! ```

use proficio_core::{CombineRule, FusionConfig, FusionError, FusionResult};
use proficio_nn::{
    ensure_finite, param_name, softmax_backward, softmax_inplace, GradientStore, NamedTensor,
    Parameterized, TensorStore,
};

/// Floor inside the logarithms of the product rule
const PRODUCT_EPS: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveCalibration {
    rule: CombineRule,
    alpha: f32,
    beta: f32,
    temperature: f32,
}

impl AdaptiveCalibration {
    /// α = β = 1
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            rule: config.combine_rule,
            alpha: 1.0,
            beta: 1.0,
            temperature: config.temperature,
        }
    }

    pub fn rule(&self) -> CombineRule {
        self.rule
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn coefficients(&self) -> (f32, f32) {
        (self.alpha, self.beta)
    }

    pub fn set_coefficients(&mut self, alpha: f32, beta: f32) {
        self.alpha = alpha;
        self.beta = beta;
    }

    /// Pre-softmax score of one view
    pub fn logit(&self, gate: f32, confidence: f32) -> f32 {
        match self.rule {
            CombineRule::Product => (gate + PRODUCT_EPS).ln() + (confidence + PRODUCT_EPS).ln(),
            CombineRule::Learned => self.alpha * gate + self.beta * confidence,
        }
    }

    /// Fusion weights for the present views, in the order given
    pub fn calibrate(&self, gates: &[f32], confidence: &[f32]) -> FusionResult<Vec<f32>> {
        if gates.len() != confidence.len() {
            return Err(FusionError::dimension(
                "calibration confidence",
                gates.len(),
                confidence.len(),
            ));
        }
        if gates.is_empty() {
            return Err(FusionError::ViewCount {
                present: 0,
                slots: 0,
                max: 0,
            });
        }

        let mut weights: Vec<f32> = gates
            .iter()
            .zip(confidence)
            .map(|(&g, &c)| self.logit(g, c) / self.temperature)
            .collect();
        ensure_finite("calibration logits", &weights)?;

        softmax_inplace(&mut weights);
        let sum: f32 = weights.iter().sum();
        for w in weights.iter_mut() {
            *w /= sum;
        }
        ensure_finite("calibration", &weights)?;
        Ok(weights)
    }

    /// Softmax output before the final renormalization
    fn raw_weights(&self, gates: &[f32], confidence: &[f32]) -> FusionResult<Vec<f32>> {
        if gates.len() != confidence.len() {
            return Err(FusionError::dimension(
                "calibration confidence",
                gates.len(),
                confidence.len(),
            ));
        }
        let mut raw: Vec<f32> = gates
            .iter()
            .zip(confidence)
            .map(|(&g, &c)| self.logit(g, c) / self.temperature)
            .collect();
        softmax_inplace(&mut raw);
        Ok(raw)
    }

    /// Gradients with respect to the gates and the confidences, given the
    /// gradient of the calibrated weights. Under the learned rule `α` and
    /// `β` also receive gradients under `prefix`.
    pub fn backward(
        &self,
        gates: &[f32],
        confidence: &[f32],
        grad_weights: &[f32],
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<(Vec<f32>, Vec<f32>)> {
        if grad_weights.len() != gates.len() {
            return Err(FusionError::dimension(
                "calibration weight gradient",
                gates.len(),
                grad_weights.len(),
            ));
        }
        let raw = self.raw_weights(gates, confidence)?;

        // w_i = raw_i / S
        let sum: f32 = raw.iter().sum();
        let carried: f32 = grad_weights.iter().zip(&raw).map(|(g, r)| g * r).sum::<f32>() / sum;
        let d_raw: Vec<f32> = grad_weights.iter().map(|g| (g - carried) / sum).collect();

        let d_logits: Vec<f32> = softmax_backward(&raw, &d_raw)?
            .into_iter()
            .map(|d| d / self.temperature)
            .collect();

        let mut d_gates = Vec::with_capacity(gates.len());
        let mut d_confidence = Vec::with_capacity(gates.len());
        match self.rule {
            CombineRule::Product => {
                for ((&d, &g), &c) in d_logits.iter().zip(gates).zip(confidence) {
                    d_gates.push(d / (g + PRODUCT_EPS));
                    d_confidence.push(d / (c + PRODUCT_EPS));
                }
            }
            CombineRule::Learned => {
                let mut d_alpha = 0.0f32;
                let mut d_beta = 0.0f32;
                for ((&d, &g), &c) in d_logits.iter().zip(gates).zip(confidence) {
                    d_gates.push(d * self.alpha);
                    d_confidence.push(d * self.beta);
                    d_alpha += d * g;
                    d_beta += d * c;
                }
                grads.accumulate_scalar(param_name(prefix, "alpha"), d_alpha);
                grads.accumulate_scalar(param_name(prefix, "beta"), d_beta);
            }
        }
        Ok((d_gates, d_confidence))
    }
}

impl Parameterized for AdaptiveCalibration {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        if self.rule == CombineRule::Learned {
            out.push(NamedTensor::scalar(param_name(prefix, "alpha"), self.alpha, true));
            out.push(NamedTensor::scalar(param_name(prefix, "beta"), self.beta, true));
        }
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        if self.rule == CombineRule::Learned {
            self.alpha = store.load_scalar(&param_name(prefix, "alpha"))?;
            self.beta = store.load_scalar(&param_name(prefix, "beta"))?;
        }
        Ok(())
    }
}
