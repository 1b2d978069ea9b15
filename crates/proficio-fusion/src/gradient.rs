//! Gradients of the fusion model
//!
//! `FusionModel::backward` walks a recorded `FusionTrace` in reverse and
//! returns a gradient for every trainable tensor, keyed by the names
//! `collect_parameters` uses, plus one gradient row per input slot. Absent
//! slots never enter the forward pass, so their input rows are exact zeros.
//!
//! Training-mode traces carry their dropout masks; backward multiplies by
//! the same masks instead of drawing new ones.

use ndarray::{Array1, Array2, ArrayView1};
use proficio_core::{FusionError, FusionResult, ViewSet};
use proficio_nn::{ensure_finite, seeded_rng, Dropout, GradientStore};
use rayon::prelude::*;

use crate::{ForwardMode, FusionModel, FusionOutput, FusionTrace};

/// Dropout masks drawn by one training-mode forward pass, in present order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DropoutMasks {
    /// Mask applied to each projected feature
    pub projected: Vec<Array1<f32>>,
    /// Mask applied to each gated feature
    pub gated: Vec<Array1<f32>>,
}

/// Gradient of the loss with respect to the model outputs
#[derive(Debug, Clone, PartialEq)]
pub struct OutputGradient {
    pub logits: Vec<f32>,
    /// Ignored when the model has no regression head
    pub score: Option<f32>,
}

impl OutputGradient {
    /// `softmax(logits) - onehot(label)`
    pub fn cross_entropy(output: &FusionOutput, label: usize) -> FusionResult<Self> {
        if label >= output.logits.len() {
            return Err(FusionError::dimension("label", output.logits.len(), label));
        }
        let mut logits = output.probabilities();
        logits[label] -= 1.0;
        Ok(Self {
            logits,
            score: None,
        })
    }

    pub fn with_score(mut self, grad: f32) -> Self {
        self.score = Some(grad);
        self
    }
}

/// Result of one backward pass
#[derive(Debug, Clone, PartialEq)]
pub struct FusionGradients {
    /// One entry per trainable tensor that the pass reached
    pub parameters: GradientStore,
    /// `[slots, D]` gradient of each input embedding; zero rows for absent slots
    pub inputs: Array2<f32>,
}

impl FusionGradients {
    pub fn input(&self, slot: usize) -> ArrayView1<'_, f32> {
        self.inputs.row(slot)
    }
}

impl FusionModel {
    /// Backward pass over a trace produced by `forward_traced` on `views`
    pub fn backward(
        &self,
        views: &ViewSet,
        trace: &FusionTrace,
        grad: &OutputGradient,
    ) -> FusionResult<FusionGradients> {
        let slots = views.len();
        if trace.projected.mask != views.presence_mask() {
            return Err(FusionError::dimension(
                "trace presence mask",
                slots,
                trace.projected.slots(),
            ));
        }
        let present = &trace.present;
        let output = &trace.output;
        let mut grads = GradientStore::new();

        let d_fused = self.head.backward(
            output.fused.view(),
            &grad.logits,
            grad.score,
            "head",
            &mut grads,
        )?;
        let aggregate = self
            .aggregator
            .backward(&trace.gated, &output.weights, d_fused.view())?;
        let (d_gates, d_confidence) = self.calibration.backward(
            &output.gates,
            &output.confidence,
            &aggregate.weights,
            "calibration",
            &mut grads,
        )?;

        let gate_width = trace.gate_values.values().ncols();
        let mut d_gate_values = Array2::<f32>::zeros((slots, gate_width));
        let mut d_context = Array2::<f32>::zeros((slots, self.config.hidden_dim));
        let mut d_slot_confidence = vec![0.0f32; slots];
        for (i, &slot) in present.iter().enumerate() {
            let d_gated = match &trace.dropout {
                Some(masks) => Dropout::backward(&masks.gated[i], &aggregate.features[i]),
                None => aggregate.features[i].clone(),
            };
            let (d_gate, d_feature) = trace.gate_values.apply_backward(
                slot,
                trace.attention.context.row(slot),
                d_gated.view(),
            );
            let mut row = d_gate_values.row_mut(slot);
            row += &d_gate;
            row += &trace.gate_values.scalar_backward(d_gates[i]);
            d_context.row_mut(slot).assign(&d_feature);
            d_slot_confidence[slot] = d_confidence[i];
        }

        d_context += &self.gating.backward(
            trace.attention.context.view(),
            &trace.projected.mask,
            d_gate_values.view(),
            "gating",
            &mut grads,
        )?;
        let d_projected = self.attention.backward(
            trace.projected.features.view(),
            &trace.projected.mask,
            d_context.view(),
            &d_slot_confidence,
            "attention",
            &mut grads,
        )?;

        let mut inputs = Array2::<f32>::zeros((slots, self.config.input_dim));
        for (i, &slot) in present.iter().enumerate() {
            let d_row = d_projected.row(slot).to_owned();
            let d_row = match &trace.dropout {
                Some(masks) => Dropout::backward(&masks.projected[i], &d_row),
                None => d_row,
            };
            let embedding = views.views()[slot].embedding().ok_or_else(|| {
                FusionError::dimension(format!("view {} embedding", slot), self.config.input_dim, 0)
            })?;
            let d_input = self
                .projector
                .backward(embedding, d_row.view(), "projector", &mut grads)?;
            inputs.row_mut(slot).assign(&d_input);
        }

        ensure_finite("input gradient", inputs.iter())?;
        ensure_finite("parameter gradient", grads.iter().flat_map(|t| t.data.iter()))?;
        tracing::trace!(
            present = present.len(),
            tensors = grads.len(),
            norm = grads.global_norm(),
            "backward pass"
        );
        Ok(FusionGradients {
            parameters: grads,
            inputs,
        })
    }

    /// Cross-entropy of one labelled sample and its gradients
    pub fn loss_and_gradients(
        &self,
        views: &ViewSet,
        label: usize,
        mode: ForwardMode<'_>,
    ) -> FusionResult<(f32, FusionGradients)> {
        let trace = self.forward_traced(views, mode)?;
        let loss = trace.output.cross_entropy(label)?;
        let grad = OutputGradient::cross_entropy(&trace.output, label)?;
        let gradients = self.backward(views, &trace, &grad)?;
        Ok((loss, gradients))
    }

    /// Mean loss and mean parameter gradient over a labelled batch.
    ///
    /// With a seed, sample `i` runs in training mode with dropout drawn from
    /// `seed + i`, matching `forward_batch_training`; without one every
    /// sample runs in inference mode.
    pub fn batch_gradients(
        &self,
        samples: &[(ViewSet, usize)],
        seed: Option<u64>,
    ) -> FusionResult<(f32, GradientStore)> {
        if samples.is_empty() {
            return Err(FusionError::Configuration("empty batch".into()));
        }
        let per_sample: Vec<(f32, GradientStore)> = samples
            .par_iter()
            .enumerate()
            .map(|(i, (views, label))| {
                let (loss, gradients) = match seed {
                    Some(seed) => {
                        let mut rng = seeded_rng(seed.wrapping_add(i as u64));
                        self.loss_and_gradients(views, *label, ForwardMode::Training(&mut rng))?
                    }
                    None => self.loss_and_gradients(views, *label, ForwardMode::Inference)?,
                };
                Ok::<_, FusionError>((loss, gradients.parameters))
            })
            .collect::<FusionResult<_>>()?;

        let scale = 1.0 / samples.len() as f32;
        let mut total = GradientStore::new();
        let mut loss = 0.0f32;
        for (sample_loss, grads) in &per_sample {
            loss += sample_loss;
            total.merge(grads);
        }
        total.scale(scale);
        Ok((loss * scale, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proficio_core::{AdapterConfig, CameraId, CombineRule, FusionConfig, GateMode, View};
    use proficio_nn::{NamedTensor, Parameterized, TensorStore};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const D: usize = 6;

    fn config() -> FusionConfig {
        FusionConfig {
            hidden_dim: 8,
            num_heads: 2,
            gate_hidden_dim: 4,
            regression_head: true,
            ..FusionConfig::compact(D)
        }
    }

    fn sample(seed: u64, mask: &[bool]) -> ViewSet {
        let mut rng = StdRng::seed_from_u64(seed);
        let views = mask
            .iter()
            .enumerate()
            .map(|(i, &present)| {
                let emb: Vec<f32> = (0..D).map(|_| rng.gen_range(-1.0..1.0)).collect();
                let camera = CameraId::new(i as u16);
                if present {
                    View::present(camera, emb)
                } else {
                    View::absent(camera)
                }
            })
            .collect::<Vec<_>>();
        ViewSet::new(views)
    }

    fn descend(model: &mut FusionModel, grads: &GradientStore, learning_rate: f32) {
        let mut tensors = Vec::new();
        model.collect_parameters("", &mut tensors);
        for tensor in tensors.iter_mut().filter(|t| t.trainable) {
            if let Some(grad) = grads.get(&tensor.name) {
                for (p, g) in tensor.data.iter_mut().zip(&grad.data) {
                    *p -= learning_rate * g;
                }
            }
        }
        model
            .load_parameters("", &TensorStore::from_tensors(tensors))
            .unwrap();
    }

    /// Cross-entropy plus `0.5 · score` so the regressor is exercised
    fn objective(model: &FusionModel, views: &ViewSet, label: usize, seed: Option<u64>) -> f32 {
        let output = match seed {
            Some(seed) => model
                .forward(views, ForwardMode::Training(&mut seeded_rng(seed)))
                .unwrap(),
            None => model.fuse(views).unwrap(),
        };
        output.cross_entropy(label).unwrap() + 0.5 * output.score.unwrap()
    }

    fn gradients(
        model: &FusionModel,
        views: &ViewSet,
        label: usize,
        seed: Option<u64>,
    ) -> FusionGradients {
        let trace = match seed {
            Some(seed) => model
                .forward_traced(views, ForwardMode::Training(&mut seeded_rng(seed)))
                .unwrap(),
            None => model.forward_traced(views, ForwardMode::Inference).unwrap(),
        };
        let grad = OutputGradient::cross_entropy(&trace.output, label)
            .unwrap()
            .with_score(0.5);
        model.backward(views, &trace, &grad).unwrap()
    }

    /// Directional derivative along a fixed pseudo-random direction over
    /// every trainable tensor, compared to the analytic inner product
    fn check_parameters(model: &FusionModel, views: &ViewSet, label: usize, seed: Option<u64>) {
        let analytic = gradients(model, views, label, seed);

        let mut tensors: Vec<NamedTensor> = Vec::new();
        model.collect_parameters("", &mut tensors);
        let mut rng = StdRng::seed_from_u64(77);
        let direction: Vec<Vec<f32>> = tensors
            .iter()
            .map(|t| {
                if t.trainable {
                    (0..t.data.len()).map(|_| rng.gen_range(-1.0..1.0)).collect()
                } else {
                    vec![0.0; t.data.len()]
                }
            })
            .collect();

        let expected: f32 = tensors
            .iter()
            .zip(&direction)
            .filter_map(|(t, d)| {
                analytic
                    .parameters
                    .get(&t.name)
                    .map(|g| g.data.iter().zip(d).map(|(a, b)| a * b).sum::<f32>())
            })
            .sum();

        let eps = 1e-3f32;
        let shifted = |sign: f32| {
            let moved: Vec<NamedTensor> = tensors
                .iter()
                .zip(&direction)
                .map(|(t, d)| {
                    let mut t = t.clone();
                    for (p, step) in t.data.iter_mut().zip(d) {
                        *p += sign * eps * step;
                    }
                    t
                })
                .collect();
            let mut copy = model.clone();
            copy.load_parameters("", &TensorStore::from_tensors(moved))
                .unwrap();
            objective(&copy, views, label, seed)
        };
        let numeric = (shifted(1.0) - shifted(-1.0)) / (2.0 * eps);
        let tolerance = 2e-2 * (1.0 + expected.abs());
        assert!(
            (numeric - expected).abs() < tolerance,
            "parameters: numeric {} analytic {}",
            numeric,
            expected
        );
    }

    fn check_inputs(model: &FusionModel, views: &ViewSet, label: usize, seed: Option<u64>) {
        let analytic = gradients(model, views, label, seed);
        let eps = 1e-3f32;
        for slot in views.present_indices() {
            for idx in [0, D - 1] {
                let nudged = |delta: f32| {
                    let mut slots = views.views().to_vec();
                    if let Some(embedding) = slots[slot].embedding.as_mut() {
                        embedding[idx] += delta;
                    }
                    objective(model, &ViewSet::new(slots), label, seed)
                };
                let numeric = (nudged(eps) - nudged(-eps)) / (2.0 * eps);
                let expected = analytic.input(slot)[idx];
                assert!(
                    (numeric - expected).abs() < 2e-2 * (1.0 + expected.abs()),
                    "slot {} idx {}: numeric {} analytic {}",
                    slot,
                    idx,
                    numeric,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_absent_slot_gradient_is_exactly_zero() {
        let model = FusionModel::seeded(config(), 1).unwrap();
        let mut slots = sample(2, &[true, false, true, false]).views().to_vec();
        slots[1].embedding = Some(vec![f32::NAN; D]);
        slots[3].embedding = Some(vec![1e30; D]);
        let views = ViewSet::new(slots);

        let (loss, grads) = model
            .loss_and_gradients(&views, 2, ForwardMode::Inference)
            .unwrap();
        assert!(loss.is_finite());
        assert_eq!(grads.inputs.dim(), (4, D));
        assert!(grads.input(1).iter().all(|&g| g == 0.0));
        assert!(grads.input(3).iter().all(|&g| g == 0.0));
        assert!(grads.input(0).iter().any(|&g| g != 0.0));
        assert!(grads.parameters.iter().all(|t| t.data.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_every_trainable_tensor_gets_a_gradient() {
        let model = FusionModel::seeded(config(), 3).unwrap();
        let grads = gradients(&model, &sample(4, &[true, true, true]), 1, None);

        let mut tensors = Vec::new();
        model.collect_parameters("", &mut tensors);
        for tensor in &tensors {
            let grad = grads.parameters.get(&tensor.name);
            assert!(grad.is_some(), "missing gradient for {}", tensor.name);
            assert_eq!(grad.unwrap().shape, tensor.shape);
        }
        assert_eq!(grads.parameters.len(), tensors.len());
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        for gate_mode in [GateMode::Scalar, GateMode::Channel] {
            for combine_rule in [CombineRule::Product, CombineRule::Learned] {
                let model = FusionModel::seeded(
                    FusionConfig {
                        gate_mode,
                        combine_rule,
                        ..config()
                    },
                    5,
                )
                .unwrap();
                let views = sample(6, &[true, false, true, true]);
                check_parameters(&model, &views, 3, None);
                check_inputs(&model, &views, 3, None);
            }
        }
    }

    #[test]
    fn test_single_view_gradients_match_finite_differences() {
        let model = FusionModel::seeded(config(), 7).unwrap();
        let views = sample(8, &[false, true]);
        check_parameters(&model, &views, 0, None);
        check_inputs(&model, &views, 0, None);
    }

    #[test]
    fn test_training_gradients_reuse_dropout_masks() {
        let model = FusionModel::seeded(
            FusionConfig {
                dropout: 0.3,
                ..config()
            },
            9,
        )
        .unwrap();
        let views = sample(10, &[true, true, false]);

        let trace = model
            .forward_traced(&views, ForwardMode::Training(&mut seeded_rng(4)))
            .unwrap();
        let masks = trace.dropout.as_ref().unwrap();
        assert_eq!(masks.projected.len(), 2);
        assert_eq!(masks.gated.len(), 2);
        assert!(model
            .forward_traced(&views, ForwardMode::Inference)
            .unwrap()
            .dropout
            .is_none());

        check_parameters(&model, &views, 2, Some(4));
        check_inputs(&model, &views, 2, Some(4));
    }

    #[test]
    fn test_adapter_base_receives_no_gradient() {
        let model = FusionModel::seeded(
            FusionConfig {
                projector_adapter: Some(AdapterConfig { rank: 2, alpha: 4.0 }),
                ..config()
            },
            11,
        )
        .unwrap();
        let (_, grads) = model
            .loss_and_gradients(&sample(12, &[true, true]), 0, ForwardMode::Inference)
            .unwrap();
        assert!(grads.parameters.get("projector.linear.base.weight").is_none());
        assert!(grads.parameters.get("projector.linear.base.bias").is_none());
        assert!(grads.parameters.get("projector.linear.adapter.a").is_some());
        assert!(grads.parameters.get("projector.linear.adapter.b").is_some());
    }

    #[test]
    fn test_gradient_step_lowers_batch_loss() {
        let mut model = FusionModel::seeded(config(), 13).unwrap();
        let samples: Vec<(ViewSet, usize)> = (0..6)
            .map(|i| (sample(300 + i, &[true, i % 2 == 0, true]), (i % 4) as usize))
            .collect();

        let (loss, grads) = model.batch_gradients(&samples, None).unwrap();
        assert!((loss - model.batch_loss(&samples).unwrap()).abs() < 1e-5);
        assert!(grads.global_norm() > 0.0);

        descend(&mut model, &grads, 0.02);
        let after = model.batch_loss(&samples).unwrap();
        assert!(after < loss, "loss went from {} to {}", loss, after);
    }

    #[test]
    fn test_batch_gradients_average_samples() {
        let model = FusionModel::seeded(config(), 15).unwrap();
        let a = (sample(20, &[true, true]), 1);
        let b = (sample(21, &[false, true, true]), 2);

        let (_, ga) = model.loss_and_gradients(&a.0, a.1, ForwardMode::Inference).unwrap();
        let (_, gb) = model.loss_and_gradients(&b.0, b.1, ForwardMode::Inference).unwrap();
        let (_, mean) = model.batch_gradients(&[a, b], None).unwrap();

        let name = "head.classifier.weight";
        let expected: Vec<f32> = ga.parameters.get(name).unwrap().data
            .iter()
            .zip(&gb.parameters.get(name).unwrap().data)
            .map(|(x, y)| 0.5 * (x + y))
            .collect();
        for (m, e) in mean.get(name).unwrap().data.iter().zip(&expected) {
            assert!((m - e).abs() < 1e-6);
        }

        assert!(model.batch_gradients(&[], None).is_err());
        let seeded = model.batch_gradients(&[(sample(22, &[true]), 0)], Some(3)).unwrap();
        assert_eq!(seeded, model.batch_gradients(&[(sample(22, &[true]), 0)], Some(3)).unwrap());
    }

    #[test]
    fn test_backward_rejects_mismatched_trace() {
        let model = FusionModel::seeded(config(), 17).unwrap();
        let views = sample(30, &[true, true]);
        let trace = model.forward_traced(&views, ForwardMode::Inference).unwrap();
        let grad = OutputGradient::cross_entropy(&trace.output, 0).unwrap();

        assert!(model.backward(&sample(30, &[true, false]), &trace, &grad).is_err());
        assert!(OutputGradient::cross_entropy(&trace.output, 9).is_err());
    }
}
