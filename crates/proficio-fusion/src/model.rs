//! Fusion model
//!
//! Owns one instance of every stage and runs them in order. Configuration
//! is checked once at construction; every forward call checks its inputs
//! and the finiteness of each stage's output.

use ndarray::Array1;
use proficio_core::{
    CameraId, FusionConfig, FusionError, FusionResult, ProficiencyLevel, ViewSet,
};
use proficio_nn::{
    log_sum_exp, param_name, seeded_rng, softmax_inplace, Dropout, NamedTensor, Parameterized,
    TensorStore,
};
use rand::{Rng, RngCore};
use rayon::prelude::*;

use crate::{
    AdaptiveCalibration, AttentionOutput, CrossViewAttention, DropoutMasks, FusionAggregator,
    GateValues, GatingNetwork, ProficiencyHead, ProjectedViews, ViewProjector,
};

/// Dropout behaviour of a forward pass
pub enum ForwardMode<'a> {
    /// No dropout; output is a pure function of inputs and parameters
    Inference,
    /// Dropout driven by the given rng
    Training(&'a mut dyn RngCore),
}

impl ForwardMode<'_> {
    pub fn is_training(&self) -> bool {
        matches!(self, ForwardMode::Training(_))
    }
}

/// Result of fusing one sample
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutput {
    /// Fused representation (H)
    pub fused: Array1<f32>,
    /// Fusion weight of each present view, on the simplex
    pub weights: Vec<f32>,
    /// Camera of each entry in `weights`
    pub cameras: Vec<CameraId>,
    /// Scalar gate of each present view
    pub gates: Vec<f32>,
    /// Attention confidence of each present view
    pub confidence: Vec<f32>,
    /// Class logits (C)
    pub logits: Vec<f32>,
    /// Continuous score when the regression head is enabled
    pub score: Option<f32>,
}

impl FusionOutput {
    pub fn present_count(&self) -> usize {
        self.weights.len()
    }

    /// Index of the largest logit (first one on ties)
    pub fn predicted_class(&self) -> usize {
        let mut best = 0;
        for (i, &logit) in self.logits.iter().enumerate() {
            if logit > self.logits[best] {
                best = i;
            }
        }
        best
    }

    /// Softmax of the logits
    pub fn probabilities(&self) -> Vec<f32> {
        let mut probs = self.logits.clone();
        softmax_inplace(&mut probs);
        probs
    }

    /// Predicted level, when the head is the four-way proficiency head
    pub fn level(&self) -> Option<ProficiencyLevel> {
        if self.logits.len() != ProficiencyLevel::COUNT {
            return None;
        }
        ProficiencyLevel::from_index(self.predicted_class())
    }

    /// Cross-entropy of the logits against a class index
    pub fn cross_entropy(&self, label: usize) -> FusionResult<f32> {
        let logit = self
            .logits
            .get(label)
            .ok_or_else(|| FusionError::dimension("label", self.logits.len(), label))?;
        Ok(log_sum_exp(&self.logits) - logit)
    }

    /// Fusion weight assigned to `camera`, if it was present
    pub fn weight_for(&self, camera: CameraId) -> Option<f32> {
        self.cameras
            .iter()
            .position(|&c| c == camera)
            .map(|i| self.weights[i])
    }
}

/// Every stage output of one forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct FusionTrace {
    /// Present slot indices, in slot order
    pub present: Vec<usize>,
    pub projected: ProjectedViews,
    pub attention: AttentionOutput,
    pub gate_values: GateValues,
    /// Gated context feature of each present view
    pub gated: Vec<Array1<f32>>,
    /// Masks drawn in training mode; `None` for inference
    pub dropout: Option<DropoutMasks>,
    pub output: FusionOutput,
}

/// View-count agnostic fusion model
#[derive(Debug, Clone, PartialEq)]
pub struct FusionModel {
    pub(crate) config: FusionConfig,
    pub(crate) projector: ViewProjector,
    pub(crate) attention: CrossViewAttention,
    pub(crate) gating: GatingNetwork,
    pub(crate) calibration: AdaptiveCalibration,
    pub(crate) aggregator: FusionAggregator,
    pub(crate) head: ProficiencyHead,
    pub(crate) dropout: Dropout,
}

impl FusionModel {
    /// Build a freshly initialised model
    pub fn new<R: Rng + ?Sized>(config: FusionConfig, rng: &mut R) -> FusionResult<Self> {
        config.validate()?;
        let model = Self {
            projector: ViewProjector::new(&config, rng)?,
            attention: CrossViewAttention::new(&config, rng),
            gating: GatingNetwork::new(&config, rng),
            calibration: AdaptiveCalibration::new(&config),
            aggregator: FusionAggregator::new(config.hidden_dim),
            head: ProficiencyHead::new(&config, rng),
            dropout: Dropout::new(config.dropout),
            config,
        };
        tracing::info!(
            input_dim = model.config.input_dim,
            hidden_dim = model.config.hidden_dim,
            heads = model.config.num_heads,
            max_views = model.config.max_views,
            "fusion model ready: {}",
            model.parameter_summary()
        );
        Ok(model)
    }

    /// Build with a fixed seed; the same seed gives the same parameters
    pub fn seeded(config: FusionConfig, seed: u64) -> FusionResult<Self> {
        Self::new(config, &mut seeded_rng(seed))
    }

    /// All-zero model with the shapes implied by `config`
    pub(crate) fn zeroed(config: FusionConfig) -> FusionResult<Self> {
        config.validate()?;
        Ok(Self {
            projector: ViewProjector::zeros(&config)?,
            attention: CrossViewAttention::zeros(&config),
            gating: GatingNetwork::zeros(&config),
            calibration: AdaptiveCalibration::new(&config),
            aggregator: FusionAggregator::new(config.hidden_dim),
            head: ProficiencyHead::zeros(&config),
            dropout: Dropout::new(config.dropout),
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn calibration(&self) -> &AdaptiveCalibration {
        &self.calibration
    }

    pub fn calibration_mut(&mut self) -> &mut AdaptiveCalibration {
        &mut self.calibration
    }

    /// Inference forward pass
    pub fn fuse(&self, views: &ViewSet) -> FusionResult<FusionOutput> {
        self.forward(views, ForwardMode::Inference)
    }

    /// Inference forward pass that also checks the caller's configuration
    /// matches the one the model was built with
    pub fn fuse_with(&self, views: &ViewSet, config: &FusionConfig) -> FusionResult<FusionOutput> {
        if config != &self.config {
            return Err(FusionError::Configuration(
                "configuration differs from the one the model was built with".into(),
            ));
        }
        self.fuse(views)
    }

    pub fn forward(&self, views: &ViewSet, mode: ForwardMode<'_>) -> FusionResult<FusionOutput> {
        self.forward_traced(views, mode).map(|trace| trace.output)
    }

    /// Forward pass that keeps every intermediate stage output
    pub fn forward_traced(
        &self,
        views: &ViewSet,
        mut mode: ForwardMode<'_>,
    ) -> FusionResult<FusionTrace> {
        let present = views.validate(self.config.input_dim, self.config.max_views)?;

        let mut masks = mode.is_training().then(DropoutMasks::default);
        let mut projected = self.projector.project_views(views)?;
        if let (ForwardMode::Training(rng), Some(masks)) = (&mut mode, &mut masks) {
            for &slot in &present {
                let mut row = projected.features.row(slot).to_owned();
                masks.projected.push(self.dropout.apply(&mut row, &mut **rng));
                projected.features.row_mut(slot).assign(&row);
            }
        }

        let attention = self
            .attention
            .forward(projected.features.view(), &projected.mask)?;
        let gate_values = self
            .gating
            .forward(attention.context.view(), &projected.mask)?;

        let gates: Vec<f32> = present.iter().map(|&s| gate_values.scalar(s)).collect();
        let confidence: Vec<f32> = present.iter().map(|&s| attention.confidence[s]).collect();
        let weights = self.calibration.calibrate(&gates, &confidence)?;

        let mut gated = Vec::with_capacity(present.len());
        for &slot in &present {
            let mut feature = gate_values.apply(slot, attention.context.row(slot));
            if let (ForwardMode::Training(rng), Some(masks)) = (&mut mode, &mut masks) {
                masks.gated.push(self.dropout.apply(&mut feature, &mut **rng));
            }
            gated.push(feature);
        }

        let fused = self.aggregator.aggregate(&gated, &weights)?;
        let head = self.head.forward(fused.view())?;

        tracing::debug!(
            slots = views.len(),
            present = present.len(),
            training = mode.is_training(),
            "fused sample"
        );

        let output = FusionOutput {
            fused,
            cameras: present.iter().map(|&s| views.views()[s].camera).collect(),
            weights,
            gates,
            confidence,
            logits: head.logits,
            score: head.score,
        };
        Ok(FusionTrace {
            present,
            projected,
            attention,
            gate_values,
            gated,
            dropout: masks,
            output,
        })
    }

    /// Fuse independent samples in parallel; fails if any sample fails
    pub fn fuse_batch(&self, samples: &[ViewSet]) -> FusionResult<Vec<FusionOutput>> {
        samples.par_iter().map(|views| self.fuse(views)).collect()
    }

    /// Training-mode batch; sample `i` draws its dropout masks from
    /// `seed + i`, so results do not depend on thread scheduling
    pub fn forward_batch_training(
        &self,
        samples: &[ViewSet],
        seed: u64,
    ) -> FusionResult<Vec<FusionOutput>> {
        samples
            .par_iter()
            .enumerate()
            .map(|(i, views)| {
                let mut rng = seeded_rng(seed.wrapping_add(i as u64));
                self.forward(views, ForwardMode::Training(&mut rng))
            })
            .collect()
    }

    /// Mean cross-entropy over labelled samples
    pub fn batch_loss(&self, samples: &[(ViewSet, usize)]) -> FusionResult<f32> {
        if samples.is_empty() {
            return Err(FusionError::Configuration("empty batch".into()));
        }
        let losses: Vec<f32> = samples
            .par_iter()
            .map(|(views, label)| self.fuse(views)?.cross_entropy(*label))
            .collect::<FusionResult<_>>()?;
        Ok(losses.iter().sum::<f32>() / losses.len() as f32)
    }

    /// Fraction of labelled samples whose predicted class matches the label
    pub fn batch_accuracy(&self, samples: &[(ViewSet, usize)]) -> FusionResult<f32> {
        if samples.is_empty() {
            return Err(FusionError::Configuration("empty batch".into()));
        }
        let classes = self.config.num_classes;
        let hits: Vec<bool> = samples
            .par_iter()
            .map(|(views, label)| {
                if *label >= classes {
                    return Err(FusionError::dimension("label", classes, *label));
                }
                Ok(self.fuse(views)?.predicted_class() == *label)
            })
            .collect::<FusionResult<_>>()?;
        Ok(hits.iter().filter(|&&hit| hit).count() as f32 / hits.len() as f32)
    }
}

impl Parameterized for FusionModel {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.projector
            .collect_parameters(&param_name(prefix, "projector"), out);
        self.attention
            .collect_parameters(&param_name(prefix, "attention"), out);
        self.gating.collect_parameters(&param_name(prefix, "gating"), out);
        self.calibration
            .collect_parameters(&param_name(prefix, "calibration"), out);
        self.head.collect_parameters(&param_name(prefix, "head"), out);
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        self.projector
            .load_parameters(&param_name(prefix, "projector"), store)?;
        self.attention
            .load_parameters(&param_name(prefix, "attention"), store)?;
        self.gating.load_parameters(&param_name(prefix, "gating"), store)?;
        self.calibration
            .load_parameters(&param_name(prefix, "calibration"), store)?;
        self.head.load_parameters(&param_name(prefix, "head"), store)
    }
}
