//! End-to-end integration runs
//!
//! Builds a model, fuses a synthetic batch in parallel, runs the property
//! suite, round-trips the parameters through the checkpoint codec and
//! checks that the restored model reproduces every output. A separate run
//! takes a few gradient steps on a synthetic batch.

use proficio_checkpoint::{decode_snapshot, encode_snapshot};
use proficio_core::{CameraId, FusionConfig, FusionError, FusionResult, View, ViewSet};
use proficio_fusion::{FusionModel, FusionOutput};
use proficio_nn::{seeded_rng, GradientStore, Parameterized, TensorStore};

use crate::{PropertyChecker, PropertyViolation, SyntheticConfig, SyntheticGenerator};

/// Integration run configuration
#[derive(Clone, Debug)]
pub struct IntegrationTestConfig {
    pub fusion: FusionConfig,
    pub synthetic: SyntheticConfig,
    /// Samples in the fused batch
    pub batch_size: usize,
    /// Samples also run through the property suite
    pub property_samples: usize,
    /// Parameter seed
    pub seed: u64,
    /// Training step stored in the checkpoint
    pub step: u64,
}

impl Default for IntegrationTestConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl IntegrationTestConfig {
    /// Small model, few samples
    pub fn minimal() -> Self {
        IntegrationTestConfig {
            fusion: FusionConfig::compact(16),
            synthetic: SyntheticConfig::light(16),
            batch_size: 8,
            property_samples: 4,
            seed: 7,
            step: 100,
        }
    }

    /// Default-sized model (768 → 512, 16 heads)
    pub fn standard() -> Self {
        let fusion = FusionConfig::default();
        IntegrationTestConfig {
            synthetic: SyntheticConfig {
                input_dim: fusion.input_dim,
                slots: fusion.max_views,
                ..Default::default()
            },
            fusion,
            batch_size: 16,
            property_samples: 4,
            seed: 7,
            step: 1000,
        }
    }

    /// Larger batch on the compact model
    pub fn stress() -> Self {
        IntegrationTestConfig {
            batch_size: 256,
            property_samples: 32,
            ..Self::minimal()
        }
    }
}

/// Integration run result
#[derive(Debug, Clone)]
pub struct IntegrationTestResult {
    pub samples_fused: usize,
    pub violations: Vec<PropertyViolation>,
    /// Restored model reproduced every batch output bit for bit
    pub checkpoint_roundtrip_ok: bool,
    pub checkpoint_bytes: usize,
    /// Mean cross-entropy of the batch
    pub mean_loss: f32,
    /// Mean weight given to the ego camera when present
    pub mean_ego_weight: f32,
}

impl IntegrationTestResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty() && self.checkpoint_roundtrip_ok && self.mean_loss.is_finite()
    }
}

pub struct IntegrationTestHarness {
    config: IntegrationTestConfig,
    model: FusionModel,
}

impl IntegrationTestHarness {
    pub fn new(config: IntegrationTestConfig) -> FusionResult<Self> {
        let model = FusionModel::seeded(config.fusion.clone(), config.seed)?;
        Ok(IntegrationTestHarness { config, model })
    }

    pub fn model(&self) -> &FusionModel {
        &self.model
    }

    pub fn run(&self) -> FusionResult<IntegrationTestResult> {
        let mut generator = SyntheticGenerator::new(self.config.synthetic.clone());
        let samples = generator.batch(self.config.batch_size);
        let views: Vec<ViewSet> = samples.iter().map(|s| s.views.clone()).collect();

        let outputs = self.model.fuse_batch(&views)?;

        let labelled: Vec<(ViewSet, usize)> =
            samples.iter().map(|s| (s.views.clone(), s.label)).collect();
        let mean_loss = self.model.batch_loss(&labelled)?;
        let mean_ego_weight = mean_weight(&outputs, CameraId::EGO);

        let checked = self.config.property_samples.min(views.len());
        let report = PropertyChecker::new(&self.model)
            .run(&views[..checked], &mut seeded_rng(self.config.seed ^ 0x5EED));

        let bytes = encode_snapshot(&self.model.snapshot(self.config.step))?;
        let snapshot = decode_snapshot(&bytes)?;
        let restored = FusionModel::restore(&snapshot)?;
        let checkpoint_roundtrip_ok = snapshot.step == self.config.step
            && restored.fuse_batch(&views)? == outputs;

        tracing::info!(
            samples = outputs.len(),
            mean_loss,
            mean_ego_weight,
            checkpoint_bytes = bytes.len(),
            checkpoint_roundtrip_ok,
            "integration run complete"
        );

        Ok(IntegrationTestResult {
            samples_fused: outputs.len(),
            violations: report.violations,
            checkpoint_roundtrip_ok,
            checkpoint_bytes: bytes.len(),
            mean_loss,
            mean_ego_weight,
        })
    }
}

fn mean_weight(outputs: &[FusionOutput], camera: CameraId) -> f32 {
    let weights: Vec<f32> = outputs.iter().filter_map(|o| o.weight_for(camera)).collect();
    if weights.is_empty() {
        return 0.0;
    }
    weights.iter().sum::<f32>() / weights.len() as f32
}

/// Three present views of width 768 fused at H = 512 with 16 heads.
/// Returns the output of two identical invocations.
pub fn run_reference_scenario() -> FusionResult<(FusionOutput, FusionOutput)> {
    let config = FusionConfig {
        input_dim: 768,
        hidden_dim: 512,
        num_heads: 16,
        ..FusionConfig::default()
    };
    let model = FusionModel::seeded(config, 2024)?;

    let mut generator = SyntheticGenerator::new(SyntheticConfig::dense(768, 3));
    let views = generator.sample().views;

    let first = model.fuse(&views)?;
    let second = model.fuse(&views)?;
    Ok((first, second))
}

/// One checkpoint, every view count from 1 to `max_views`
pub fn run_view_count_sweep(config: FusionConfig, seed: u64) -> FusionResult<Vec<FusionOutput>> {
    let model = FusionModel::seeded(config.clone(), seed)?;
    let restored = FusionModel::restore(&decode_snapshot(&encode_snapshot(
        &model.snapshot(0),
    )?)?)?;

    let mut generator = SyntheticGenerator::new(SyntheticConfig::dense(config.input_dim, 1));
    let mut outputs = Vec::with_capacity(config.max_views);
    for k in 1..=config.max_views {
        let views: Vec<View> = (0..k)
            .map(|slot| {
                View::present(
                    SyntheticGenerator::camera(slot),
                    generator.embedding(0, slot),
                )
            })
            .collect();
        outputs.push(restored.fuse(&ViewSet::new(views))?);
    }
    Ok(outputs)
}

/// Loss before and after a short gradient-descent run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRun {
    pub initial_loss: f32,
    pub final_loss: f32,
    /// Gradient norm of each step
    pub gradient_norms: Vec<f32>,
}

/// Plain gradient descent, standing in for an external optimizer:
/// `p -= learning_rate · grad` on every trainable tensor with a gradient
pub fn sgd_step(
    model: &mut FusionModel,
    grads: &GradientStore,
    learning_rate: f32,
) -> FusionResult<()> {
    let mut tensors = Vec::new();
    model.collect_parameters("", &mut tensors);
    for tensor in tensors.iter_mut().filter(|t| t.trainable) {
        let Some(grad) = grads.get(&tensor.name) else {
            continue;
        };
        if grad.shape != tensor.shape {
            return Err(FusionError::TensorShape {
                name: tensor.name.clone(),
                expected: tensor.shape.clone(),
                actual: grad.shape.clone(),
            });
        }
        for (p, g) in tensor.data.iter_mut().zip(&grad.data) {
            *p -= learning_rate * g;
        }
    }
    model.load_parameters("", &TensorStore::from_tensors(tensors))
}

/// Take `steps` gradient steps on one synthetic batch. Step `i` draws its
/// dropout masks from `seed + i`; losses are measured in inference mode.
pub fn run_training_steps(
    config: FusionConfig,
    synthetic: SyntheticConfig,
    seed: u64,
    steps: usize,
    learning_rate: f32,
) -> FusionResult<TrainingRun> {
    let mut model = FusionModel::seeded(config, seed)?;
    let labelled: Vec<(ViewSet, usize)> = SyntheticGenerator::new(synthetic)
        .batch(16)
        .into_iter()
        .map(|s| (s.views, s.label))
        .collect();

    let initial_loss = model.batch_loss(&labelled)?;
    let mut gradient_norms = Vec::with_capacity(steps);
    for step in 0..steps {
        let (loss, grads) =
            model.batch_gradients(&labelled, Some(seed.wrapping_add(step as u64)))?;
        gradient_norms.push(grads.global_norm());
        tracing::debug!(step, loss, norm = grads.global_norm(), "gradient step");
        sgd_step(&mut model, &grads, learning_rate)?;
    }
    let final_loss = model.batch_loss(&labelled)?;
    tracing::info!(initial_loss, final_loss, steps, "training run complete");

    Ok(TrainingRun {
        initial_loss,
        final_loss,
        gradient_norms,
    })
}
