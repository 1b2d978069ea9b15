//! Fusion property checks
//!
//! Tests:
//! - Weights lie on the simplex over the present views
//! - Fused width is H whatever the view count
//! - Slot order does not change the output
//! - Absent slot content never reaches the output
//! - Inference is deterministic
//! - A lone view passes through aggregation unchanged
//! - Absent slots receive exactly zero input gradient

use proficio_core::{FusionError, View, ViewSet};
use proficio_fusion::{ForwardMode, FusionModel, FusionOutput};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

/// Tolerance on the weight sum
pub const SIMPLEX_TOLERANCE: f32 = 1e-5;

/// Tolerance on fused values under reordering
pub const ORDER_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropertyViolation {
    #[error("weights not on simplex: sum {sum}, min {min}")]
    Simplex { sum: f32, min: f32 },

    #[error("{actual} weights for {expected} present views")]
    WeightCount { expected: usize, actual: usize },

    #[error("fused width {actual}, expected {expected}")]
    FusedWidth { expected: usize, actual: usize },

    #[error("slot order moved the fused output by {max_diff}")]
    OrderDependence { max_diff: f32 },

    #[error("absent slot content changed the output")]
    MaskLeak,

    #[error("repeated inference differed")]
    NonDeterministic,

    #[error("single view output differs from its gated context")]
    SingleViewPassThrough,

    #[error("absent slot {slot} received a non-zero gradient")]
    GradientLeak { slot: usize },

    #[error("fusion failed: {0}")]
    Fusion(#[from] FusionError),
}

pub type PropertyResult = Result<(), PropertyViolation>;

/// Outcome of a property run
#[derive(Debug, Default, Clone)]
pub struct PropertyReport {
    pub samples_checked: usize,
    pub checks_run: usize,
    pub violations: Vec<PropertyViolation>,
}

impl PropertyReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    fn record(&mut self, result: PropertyResult) {
        self.checks_run += 1;
        if let Err(violation) = result {
            tracing::warn!(%violation, "fusion property violated");
            self.violations.push(violation);
        }
    }
}

/// Runs every property against one model
pub struct PropertyChecker<'a> {
    model: &'a FusionModel,
}

impl<'a> PropertyChecker<'a> {
    pub fn new(model: &'a FusionModel) -> Self {
        PropertyChecker { model }
    }

    /// Weight count, simplex and fused width of one output
    pub fn check_output(&self, views: &ViewSet, out: &FusionOutput) -> PropertyResult {
        let expected = views.present_count();
        if out.weights.len() != expected {
            return Err(PropertyViolation::WeightCount {
                expected,
                actual: out.weights.len(),
            });
        }
        let sum: f32 = out.weights.iter().sum();
        let min = out.weights.iter().copied().fold(f32::INFINITY, f32::min);
        if (sum - 1.0).abs() > SIMPLEX_TOLERANCE || min < 0.0 {
            return Err(PropertyViolation::Simplex { sum, min });
        }
        let hidden = self.model.config().hidden_dim;
        if out.fused.len() != hidden {
            return Err(PropertyViolation::FusedWidth {
                expected: hidden,
                actual: out.fused.len(),
            });
        }
        Ok(())
    }

    /// Shuffle the slots and compare the fused output
    pub fn check_order_invariance<R: Rng + ?Sized>(
        &self,
        views: &ViewSet,
        rng: &mut R,
    ) -> PropertyResult {
        let mut order: Vec<usize> = (0..views.len()).collect();
        order.shuffle(rng);
        let reordered = views.permuted(&order)?;

        let a = self.model.fuse(views)?;
        let b = self.model.fuse(&reordered)?;
        let max_diff = a
            .fused
            .iter()
            .zip(b.fused.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        if max_diff > ORDER_TOLERANCE {
            return Err(PropertyViolation::OrderDependence { max_diff });
        }
        Ok(())
    }

    /// Fill every absent slot with garbage; the output must be bit-identical
    pub fn check_mask_invariance(&self, views: &ViewSet) -> PropertyResult {
        let baseline = self.model.fuse(views)?;
        let input_dim = self.model.config().input_dim;
        for garbage in [f32::NAN, 1e30, -7.5] {
            let poisoned: Vec<View> = views
                .views()
                .iter()
                .map(|v| {
                    if v.present {
                        v.clone()
                    } else {
                        View {
                            embedding: Some(vec![garbage; input_dim]),
                            ..v.clone()
                        }
                    }
                })
                .collect();
            if self.model.fuse(&ViewSet::new(poisoned))? != baseline {
                return Err(PropertyViolation::MaskLeak);
            }
        }
        Ok(())
    }

    pub fn check_determinism(&self, views: &ViewSet) -> PropertyResult {
        if self.model.fuse(views)? != self.model.fuse(views)? {
            return Err(PropertyViolation::NonDeterministic);
        }
        Ok(())
    }

    /// Keep only the first present view and check it passes through exactly
    pub fn check_single_view(&self, views: &ViewSet) -> PropertyResult {
        let mut kept = false;
        let single: Vec<View> = views
            .views()
            .iter()
            .map(|v| {
                if v.present && !kept {
                    kept = true;
                    v.clone()
                } else {
                    View::absent(v.camera)
                }
            })
            .collect();

        let trace = self
            .model
            .forward_traced(&ViewSet::new(single), ForwardMode::Inference)?;
        if trace.output.weights != [1.0] || trace.gated.first() != Some(&trace.output.fused) {
            return Err(PropertyViolation::SingleViewPassThrough);
        }
        Ok(())
    }

    /// Backpropagate a cross-entropy loss; every absent input row must be
    /// exactly zero
    pub fn check_gradient_isolation(&self, views: &ViewSet) -> PropertyResult {
        let (_, grads) = self
            .model
            .loss_and_gradients(views, 0, ForwardMode::Inference)?;
        for (slot, view) in views.views().iter().enumerate() {
            if !view.present && grads.input(slot).iter().any(|&g| g != 0.0) {
                return Err(PropertyViolation::GradientLeak { slot });
            }
        }
        Ok(())
    }

    /// Every check on one sample
    pub fn check_all<R: Rng + ?Sized>(&self, views: &ViewSet, rng: &mut R, report: &mut PropertyReport) {
        report.samples_checked += 1;
        match self.model.fuse(views) {
            Ok(out) => report.record(self.check_output(views, &out)),
            Err(err) => report.record(Err(err.into())),
        }
        report.record(self.check_order_invariance(views, rng));
        report.record(self.check_mask_invariance(views));
        report.record(self.check_determinism(views));
        report.record(self.check_single_view(views));
        report.record(self.check_gradient_isolation(views));
    }

    pub fn run<R: Rng + ?Sized>(&self, samples: &[ViewSet], rng: &mut R) -> PropertyReport {
        let mut report = PropertyReport::default();
        for views in samples {
            self.check_all(views, rng, &mut report);
        }
        tracing::info!(
            samples = report.samples_checked,
            checks = report.checks_run,
            violations = report.violations.len(),
            "property run complete"
        );
        report
    }
}
