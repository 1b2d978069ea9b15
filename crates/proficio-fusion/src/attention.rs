//! Cross-view attention
//!
//! Multi-head scaled dot-product self-attention over the view slots of one
//! sample. Scores towards absent slots are masked to negative infinity, so
//! every present query distributes its weight over present keys only.
//! There is no positional encoding: slot order carries no meaning.
//!
//! ```text
//! q, k, v   = x·Wq, x·Wk, x·Wv                       (present rows only)
//! a[h,i,:]  = masked_softmax(q_h[i]·k_h[j] / sqrt(d_h))
//! ctx[i]    = LayerNorm(x[i] + concat_h(Σ_j a[h,i,j] v_h[j])·Wo)
//! ```

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use proficio_core::{FusionConfig, FusionError, FusionResult};
use proficio_nn::{
    ensure_finite, masked_softmax_backward, masked_softmax_inplace, param_name, GradientStore,
    LayerNorm, Linear, NamedTensor, Parameterized, TensorStore,
};
use rand::Rng;

/// Attention result for one sample
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionOutput {
    /// Contextualized features `[slots, H]`; absent rows are zero
    pub context: Array2<f32>,
    /// Per-head weights `[heads, slots, slots]`, indexed `[h, query, key]`
    pub weights: Array3<f32>,
    /// Attention each present slot receives from the other present slots,
    /// averaged over heads; zero for absent slots
    pub confidence: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossViewAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl CrossViewAttention {
    pub fn new<R: Rng + ?Sized>(config: &FusionConfig, rng: &mut R) -> Self {
        let h = config.hidden_dim;
        Self {
            query: Linear::new(rng, h, h),
            key: Linear::new(rng, h, h),
            value: Linear::new(rng, h, h),
            output: Linear::new(rng, h, h),
            norm: LayerNorm::new(h, config.layer_norm_eps),
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        }
    }

    pub fn zeros(config: &FusionConfig) -> Self {
        let h = config.hidden_dim;
        Self {
            query: Linear::zeros(h, h),
            key: Linear::zeros(h, h),
            value: Linear::zeros(h, h),
            output: Linear::zeros(h, h),
            norm: LayerNorm::new(h, config.layer_norm_eps),
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn hidden_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Projections, weights and head mix for the present rows
    fn compute(&self, features: ArrayView2<f32>, mask: &[bool]) -> FusionResult<Internals> {
        let slots = features.nrows();
        let hidden = self.hidden_dim();
        if mask.len() != slots {
            return Err(FusionError::dimension("attention mask", slots, mask.len()));
        }
        if features.ncols() != hidden {
            return Err(FusionError::dimension("attention input", hidden, features.ncols()));
        }

        let present: Vec<usize> = (0..slots).filter(|&i| mask[i]).collect();
        if present.is_empty() {
            return Err(FusionError::ViewCount {
                present: 0,
                slots,
                max: slots,
            });
        }

        let mut q = Array2::<f32>::zeros((slots, hidden));
        let mut k = Array2::<f32>::zeros((slots, hidden));
        let mut v = Array2::<f32>::zeros((slots, hidden));
        for &i in &present {
            let x = features.row(i);
            q.row_mut(i).assign(&self.query.forward(x)?);
            k.row_mut(i).assign(&self.key.forward(x)?);
            v.row_mut(i).assign(&self.value.forward(x)?);
        }

        let scale = self.scale();
        let mut weights = Array3::<f32>::zeros((self.num_heads, slots, slots));
        let mut mixed = Array2::<f32>::zeros((slots, hidden));
        let mut scores = vec![0.0f32; slots];

        for h in 0..self.num_heads {
            let (lo, hi) = self.head_range(h);
            for &i in &present {
                let qi = q.slice(s![i, lo..hi]);
                for (j, score) in scores.iter_mut().enumerate() {
                    *score = if mask[j] {
                        qi.dot(&k.slice(s![j, lo..hi])) * scale
                    } else {
                        0.0
                    };
                }
                masked_softmax_inplace(&mut scores, mask)?;

                let mut out = mixed.slice_mut(s![i, lo..hi]);
                for &j in &present {
                    weights[[h, i, j]] = scores[j];
                    out.scaled_add(scores[j], &v.slice(s![j, lo..hi]));
                }
            }
        }
        ensure_finite("attention weights", weights.iter())?;

        Ok(Internals {
            present,
            q,
            k,
            v,
            weights,
            mixed,
        })
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    fn head_range(&self, h: usize) -> (usize, usize) {
        let lo = h * self.head_dim;
        (lo, lo + self.head_dim)
    }

    pub fn forward(&self, features: ArrayView2<f32>, mask: &[bool]) -> FusionResult<AttentionOutput> {
        let slots = features.nrows();
        let Internals {
            present,
            weights,
            mixed,
            ..
        } = self.compute(features, mask)?;

        let mut context = Array2::<f32>::zeros((slots, self.hidden_dim()));
        for &i in &present {
            let residual = self.output.forward(mixed.row(i))? + &features.row(i);
            context.row_mut(i).assign(&self.norm.forward(residual.view())?);
        }
        ensure_finite("attention", context.iter())?;

        let confidence = received_attention(&weights, &present, slots);
        tracing::debug!(present = present.len(), heads = self.num_heads, "cross-view attention");

        Ok(AttentionOutput {
            context,
            weights,
            confidence,
        })
    }

    /// Gradient with respect to `features` given the gradients of the
    /// context rows and of the confidence vector.
    ///
    /// Rows of absent slots come back as exact zeros: they never entered
    /// the forward pass.
    pub fn backward(
        &self,
        features: ArrayView2<f32>,
        mask: &[bool],
        grad_context: ArrayView2<f32>,
        grad_confidence: &[f32],
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array2<f32>> {
        let slots = features.nrows();
        let hidden = self.hidden_dim();
        if grad_context.dim() != (slots, hidden) {
            return Err(FusionError::dimension(
                "attention context gradient",
                slots * hidden,
                grad_context.len(),
            ));
        }
        if grad_confidence.len() != slots {
            return Err(FusionError::dimension(
                "attention confidence gradient",
                slots,
                grad_confidence.len(),
            ));
        }
        let Internals {
            present,
            q,
            k,
            v,
            weights,
            mixed,
        } = self.compute(features, mask)?;

        let output_prefix = param_name(prefix, "output");
        let norm_prefix = param_name(prefix, "norm");
        let mut d_features = Array2::<f32>::zeros((slots, hidden));
        let mut d_mixed = Array2::<f32>::zeros((slots, hidden));
        for &i in &present {
            let residual = self.output.forward(mixed.row(i))? + &features.row(i);
            let d_residual =
                self.norm
                    .backward(residual.view(), grad_context.row(i), &norm_prefix, grads)?;
            d_features.row_mut(i).scaled_add(1.0, &d_residual);
            let dm = self
                .output
                .backward(mixed.row(i), d_residual.view(), &output_prefix, grads)?;
            d_mixed.row_mut(i).assign(&dm);
        }

        // confidence_j = Σ_h Σ_{i≠j} a[h,i,j] / (heads · (k - 1)); constant when k = 1
        let mut d_weights = Array3::<f32>::zeros(weights.dim());
        if present.len() > 1 {
            let denom = (self.num_heads * (present.len() - 1)) as f32;
            for h in 0..self.num_heads {
                for &i in &present {
                    for &j in &present {
                        if i != j {
                            d_weights[[h, i, j]] = grad_confidence[j] / denom;
                        }
                    }
                }
            }
        }

        let scale = self.scale();
        let mut dq = Array2::<f32>::zeros((slots, hidden));
        let mut dk = Array2::<f32>::zeros((slots, hidden));
        let mut dv = Array2::<f32>::zeros((slots, hidden));
        for h in 0..self.num_heads {
            let (lo, hi) = self.head_range(h);
            for &i in &present {
                let dm = d_mixed.slice(s![i, lo..hi]).to_owned();
                for &j in &present {
                    d_weights[[h, i, j]] += dm.dot(&v.slice(s![j, lo..hi]));
                    dv.slice_mut(s![j, lo..hi]).scaled_add(weights[[h, i, j]], &dm);
                }

                let probs = weights.slice(s![h, i, ..]).to_vec();
                let d_probs = d_weights.slice(s![h, i, ..]).to_vec();
                let d_scores = masked_softmax_backward(&probs, &d_probs, mask)?;
                let qi = q.slice(s![i, lo..hi]).to_owned();
                for &j in &present {
                    let ds = d_scores[j] * scale;
                    dq.slice_mut(s![i, lo..hi]).scaled_add(ds, &k.slice(s![j, lo..hi]));
                    dk.slice_mut(s![j, lo..hi]).scaled_add(ds, &qi);
                }
            }
        }

        let query_prefix = param_name(prefix, "query");
        let key_prefix = param_name(prefix, "key");
        let value_prefix = param_name(prefix, "value");
        for &i in &present {
            let x = features.row(i);
            let dx = self.query.backward(x, dq.row(i), &query_prefix, grads)?
                + self.key.backward(x, dk.row(i), &key_prefix, grads)?
                + self.value.backward(x, dv.row(i), &value_prefix, grads)?;
            d_features.row_mut(i).scaled_add(1.0, &dx);
        }
        Ok(d_features)
    }
}

/// Intermediate values shared by the forward and backward passes
struct Internals {
    present: Vec<usize>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    weights: Array3<f32>,
    mixed: Array2<f32>,
}

/// Mean weight slot `j` receives from the other present queries, over heads.
/// A lone view attends only to itself and gets full confidence.
fn received_attention(weights: &Array3<f32>, present: &[usize], slots: usize) -> Vec<f32> {
    let mut confidence = vec![0.0f32; slots];
    if let [only] = present {
        confidence[*only] = 1.0;
        return confidence;
    }

    let heads = weights.len_of(Axis(0));
    let denom = (heads * (present.len() - 1)) as f32;
    for &j in present {
        let mut total = 0.0f32;
        for h in 0..heads {
            for &i in present {
                if i != j {
                    total += weights[[h, i, j]];
                }
            }
        }
        confidence[j] = total / denom;
    }
    confidence
}

impl Parameterized for CrossViewAttention {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.query.collect_parameters(&param_name(prefix, "query"), out);
        self.key.collect_parameters(&param_name(prefix, "key"), out);
        self.value.collect_parameters(&param_name(prefix, "value"), out);
        self.output.collect_parameters(&param_name(prefix, "output"), out);
        self.norm.collect_parameters(&param_name(prefix, "norm"), out);
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        self.query.load_parameters(&param_name(prefix, "query"), store)?;
        self.key.load_parameters(&param_name(prefix, "key"), store)?;
        self.value.load_parameters(&param_name(prefix, "value"), store)?;
        self.output.load_parameters(&param_name(prefix, "output"), store)?;
        self.norm.load_parameters(&param_name(prefix, "norm"), store)
    }
}
