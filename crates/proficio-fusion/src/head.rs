//! Proficiency head
//!
//! A linear classifier over the fused feature, with an optional linear
//! regressor producing a continuous score.

use ndarray::{Array1, ArrayView1};
use proficio_core::{FusionConfig, FusionError, FusionResult};
use proficio_nn::{
    ensure_finite, param_name, GradientStore, Linear, NamedTensor, Parameterized, TensorStore,
};
use rand::Rng;

/// Head result for one fused feature
#[derive(Debug, Clone, PartialEq)]
pub struct HeadOutput {
    /// One logit per proficiency class
    pub logits: Vec<f32>,
    /// Continuous score; `None` without a regressor
    pub score: Option<f32>,
}

/// Classifier over the fused feature (`head.classifier`), plus the
/// optional one-output regressor (`head.regressor`)
#[derive(Debug, Clone, PartialEq)]
pub struct ProficiencyHead {
    classifier: Linear,
    regressor: Option<Linear>,
}

impl ProficiencyHead {
    pub fn new<R: Rng + ?Sized>(config: &FusionConfig, rng: &mut R) -> Self {
        let classifier = Linear::new(rng, config.hidden_dim, config.num_classes);
        let regressor = config
            .regression_head
            .then(|| Linear::new(rng, config.hidden_dim, 1));
        Self {
            classifier,
            regressor,
        }
    }

    pub fn zeros(config: &FusionConfig) -> Self {
        Self {
            classifier: Linear::zeros(config.hidden_dim, config.num_classes),
            regressor: config
                .regression_head
                .then(|| Linear::zeros(config.hidden_dim, 1)),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classifier.out_dim()
    }

    pub fn has_regressor(&self) -> bool {
        self.regressor.is_some()
    }

    pub fn forward(&self, fused: ArrayView1<f32>) -> FusionResult<HeadOutput> {
        if fused.len() != self.classifier.in_dim() {
            return Err(FusionError::dimension(
                "head input",
                self.classifier.in_dim(),
                fused.len(),
            ));
        }
        let logits = self.classifier.forward(fused)?.to_vec();
        ensure_finite("head", &logits)?;

        let score = match &self.regressor {
            Some(regressor) => {
                let score = regressor.forward(fused)?[0];
                ensure_finite("head score", [score].iter())?;
                Some(score)
            }
            None => None,
        };
        Ok(HeadOutput { logits, score })
    }

    /// Gradient with respect to the fused feature given the gradients of
    /// the logits and, when a regressor exists, of the score
    pub fn backward(
        &self,
        fused: ArrayView1<f32>,
        grad_logits: &[f32],
        grad_score: Option<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        let grad_logits = Array1::from(grad_logits.to_vec());
        let mut d_fused = self.classifier.backward(
            fused,
            grad_logits.view(),
            &param_name(prefix, "classifier"),
            grads,
        )?;
        if let (Some(regressor), Some(grad)) = (&self.regressor, grad_score) {
            d_fused += &regressor.backward(
                fused,
                Array1::from_elem(1, grad).view(),
                &param_name(prefix, "regressor"),
                grads,
            )?;
        }
        Ok(d_fused)
    }
}

impl Parameterized for ProficiencyHead {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.classifier
            .collect_parameters(&param_name(prefix, "classifier"), out);
        if let Some(regressor) = &self.regressor {
            regressor.collect_parameters(&param_name(prefix, "regressor"), out);
        }
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        self.classifier
            .load_parameters(&param_name(prefix, "classifier"), store)?;
        if let Some(regressor) = &mut self.regressor {
            regressor.load_parameters(&param_name(prefix, "regressor"), store)?;
        }
        Ok(())
    }
}
