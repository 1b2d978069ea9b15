//! View projector
//!
//! Maps each present view's backbone embedding (D) into the shared fusion
//! space (H) with one affine layer followed by layer normalization. The same
//! weights are applied to every camera.

use ndarray::{Array1, Array2, ArrayView1};
use proficio_core::{FusionConfig, FusionError, FusionResult, View, ViewSet};
use proficio_nn::{
    ensure_finite, param_name, AdaptedLinear, GradientStore, LayerNorm, Linear, LowRankAdapter,
    NamedTensor, Parameterized, TensorStore,
};
use rand::Rng;

/// Projected features for every slot of a sample
///
/// Rows of absent slots are zero placeholders; downstream stages only read
/// rows whose `mask` entry is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedViews {
    /// `[slots, H]`, one row per input slot
    pub features: Array2<f32>,
    /// Presence of each slot, in input order
    pub mask: Vec<bool>,
}

impl ProjectedViews {
    /// Number of slots, present or not
    pub fn slots(&self) -> usize {
        self.mask.len()
    }

    /// Number of rows holding a real projection
    pub fn present_count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Projection {
    Dense(Linear),
    Adapted(AdaptedLinear),
}

impl Projection {
    fn forward(&self, x: ArrayView1<f32>) -> FusionResult<Array1<f32>> {
        match self {
            Projection::Dense(layer) => layer.forward(x),
            Projection::Adapted(layer) => layer.forward(x),
        }
    }

    fn backward(
        &self,
        x: ArrayView1<f32>,
        grad_out: ArrayView1<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        match self {
            Projection::Dense(layer) => layer.backward(x, grad_out, prefix, grads),
            Projection::Adapted(layer) => layer.backward(x, grad_out, prefix, grads),
        }
    }
}

/// Shared D → H projection
///
/// With `projector_adapter` set the affine layer is a frozen base under a
/// low-rank overlay, and only the overlay and the norm are trainable.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewProjector {
    projection: Projection,
    norm: LayerNorm,
    input_dim: usize,
    hidden_dim: usize,
}

impl ViewProjector {
    pub fn new<R: Rng + ?Sized>(config: &FusionConfig, rng: &mut R) -> FusionResult<Self> {
        let base = Linear::new(rng, config.input_dim, config.hidden_dim);
        let projection = match config.projector_adapter {
            None => Projection::Dense(base),
            Some(adapter) => {
                let overlay =
                    LowRankAdapter::new(rng, config.input_dim, config.hidden_dim, adapter);
                Projection::Adapted(AdaptedLinear::new(base, overlay)?)
            }
        };
        Ok(Self::with_projection(config, projection))
    }

    /// Zero-initialised projector with the right shapes
    pub fn zeros(config: &FusionConfig) -> FusionResult<Self> {
        let base = Linear::zeros(config.input_dim, config.hidden_dim);
        let projection = match config.projector_adapter {
            None => Projection::Dense(base),
            Some(adapter) => Projection::Adapted(AdaptedLinear::new(
                base,
                LowRankAdapter::zeros(config.input_dim, config.hidden_dim, adapter),
            )?),
        };
        Ok(Self::with_projection(config, projection))
    }

    fn with_projection(config: &FusionConfig, projection: Projection) -> Self {
        Self {
            projection,
            norm: LayerNorm::new(config.hidden_dim, config.layer_norm_eps),
            input_dim: config.input_dim,
            hidden_dim: config.hidden_dim,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn is_adapted(&self) -> bool {
        matches!(self.projection, Projection::Adapted(_))
    }

    /// Project one embedding of length D
    pub fn project(&self, embedding: &[f32]) -> FusionResult<Array1<f32>> {
        if embedding.len() != self.input_dim {
            return Err(FusionError::dimension(
                "projector input",
                self.input_dim,
                embedding.len(),
            ));
        }
        let hidden = self.projection.forward(ArrayView1::from(embedding))?;
        let out = self.norm.forward(hidden.view())?;
        ensure_finite("projector", out.iter())?;
        Ok(out)
    }

    /// Gradient with respect to one embedding, given the gradient of its
    /// projection. Parameter gradients go under `prefix`.
    pub fn backward(
        &self,
        embedding: &[f32],
        grad_out: ArrayView1<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array1<f32>> {
        if embedding.len() != self.input_dim {
            return Err(FusionError::dimension(
                "projector input",
                self.input_dim,
                embedding.len(),
            ));
        }
        let x = ArrayView1::from(embedding);
        let hidden = self.projection.forward(x)?;
        let d_hidden = self
            .norm
            .backward(hidden.view(), grad_out, &param_name(prefix, "norm"), grads)?;
        self.projection
            .backward(x, d_hidden.view(), &param_name(prefix, "linear"), grads)
    }

    /// Project a single slot; `None` for an absent view
    pub fn project_view(&self, view: &View) -> FusionResult<Option<Array1<f32>>> {
        match view.embedding() {
            Some(embedding) if view.present => self.project(embedding).map(Some),
            _ => Ok(None),
        }
    }

    /// Project every present slot of `views`, leaving zero rows elsewhere
    pub fn project_views(&self, views: &ViewSet) -> FusionResult<ProjectedViews> {
        let slots = views.len();
        let mut features = Array2::zeros((slots, self.hidden_dim));
        let mut mask = vec![false; slots];
        for (slot, view) in views.views().iter().enumerate() {
            if let Some(projected) = self.project_view(view)? {
                features.row_mut(slot).assign(&projected);
                mask[slot] = true;
            }
        }
        Ok(ProjectedViews { features, mask })
    }
}

impl Parameterized for ViewProjector {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        let linear = param_name(prefix, "linear");
        match &self.projection {
            Projection::Dense(layer) => layer.collect_parameters(&linear, out),
            Projection::Adapted(layer) => layer.collect_parameters(&linear, out),
        }
        self.norm.collect_parameters(&param_name(prefix, "norm"), out);
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        let linear = param_name(prefix, "linear");
        match &mut self.projection {
            Projection::Dense(layer) => layer.load_parameters(&linear, store)?,
            Projection::Adapted(layer) => layer.load_parameters(&linear, store)?,
        }
        self.norm.load_parameters(&param_name(prefix, "norm"), store)
    }
}
