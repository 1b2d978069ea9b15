//! Per-view relevance gates
//!
//! Each present view is scored from its own context feature and a summary
//! of the other present views (their mean, or zeros for a lone view):
//!
//! ```text
//! g_i = sigmoid(W2 · gelu(W1 · [ctx_i ; mean_{j≠i} ctx_j] + b1) + b2)
//! ```
//!
//! In `Channel` mode `g_i` has H entries, in `Scalar` mode a single one.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use proficio_core::{FusionConfig, FusionError, FusionResult, GateMode};
use proficio_nn::{
    ensure_finite, gelu, gelu_grad, gelu_inplace, param_name, sigmoid_grad_from_output,
    sigmoid_inplace, GradientStore, Linear, NamedTensor, Parameterized, TensorStore,
};
use rand::Rng;

/// Gate values for every slot of a sample; absent rows are zero
#[derive(Debug, Clone, PartialEq)]
pub struct GateValues {
    values: Array2<f32>,
    mode: GateMode,
}

impl GateValues {
    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// `[slots, width]` where width is H (channel) or 1 (scalar)
    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn gate(&self, slot: usize) -> ArrayView1<'_, f32> {
        self.values.row(slot)
    }

    /// Scalar relevance of a slot: the gate itself, or the channel mean
    pub fn scalar(&self, slot: usize) -> f32 {
        let row = self.values.row(slot);
        row.sum() / row.len() as f32
    }

    /// `gate ⊙ feature`
    pub fn apply(&self, slot: usize, feature: ArrayView1<f32>) -> Array1<f32> {
        match self.mode {
            GateMode::Scalar => feature.mapv(|x| x * self.values[[slot, 0]]),
            GateMode::Channel => &feature * &self.values.row(slot),
        }
    }

    /// Gradients of `apply` with respect to the gate row and the feature
    pub fn apply_backward(
        &self,
        slot: usize,
        feature: ArrayView1<f32>,
        grad_out: ArrayView1<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        match self.mode {
            GateMode::Scalar => {
                let gate = self.values[[slot, 0]];
                (
                    Array1::from_elem(1, grad_out.dot(&feature)),
                    grad_out.mapv(|g| g * gate),
                )
            }
            GateMode::Channel => (&grad_out * &feature, &grad_out * &self.values.row(slot)),
        }
    }

    /// Gradient of `scalar(slot)` spread over the gate row
    pub fn scalar_backward(&self, grad: f32) -> Array1<f32> {
        let width = self.values.ncols();
        Array1::from_elem(width, grad / width as f32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatingNetwork {
    hidden: Linear,
    gate: Linear,
    mode: GateMode,
}

impl GatingNetwork {
    pub fn new<R: Rng + ?Sized>(config: &FusionConfig, rng: &mut R) -> Self {
        Self {
            hidden: Linear::new(rng, 2 * config.hidden_dim, config.gate_hidden_dim),
            gate: Linear::new(rng, config.gate_hidden_dim, gate_width(config)),
            mode: config.gate_mode,
        }
    }

    pub fn zeros(config: &FusionConfig) -> Self {
        Self {
            hidden: Linear::zeros(2 * config.hidden_dim, config.gate_hidden_dim),
            gate: Linear::zeros(config.gate_hidden_dim, gate_width(config)),
            mode: config.gate_mode,
        }
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Present slots after checking shapes
    fn check(&self, context: ArrayView2<f32>, mask: &[bool]) -> FusionResult<Vec<usize>> {
        let slots = context.nrows();
        let hidden = context.ncols();
        if mask.len() != slots {
            return Err(FusionError::dimension("gating mask", slots, mask.len()));
        }
        if 2 * hidden != self.hidden.in_dim() {
            return Err(FusionError::dimension(
                "gating input",
                self.hidden.in_dim() / 2,
                hidden,
            ));
        }

        let present: Vec<usize> = (0..slots).filter(|&i| mask[i]).collect();
        if present.is_empty() {
            return Err(FusionError::ViewCount {
                present: 0,
                slots,
                max: slots,
            });
        }
        Ok(present)
    }

    pub fn forward(&self, context: ArrayView2<f32>, mask: &[bool]) -> FusionResult<GateValues> {
        let slots = context.nrows();
        let present = self.check(context, mask)?;

        let mut values = Array2::<f32>::zeros((slots, self.gate.out_dim()));
        for &i in &present {
            let input = gate_input(context, &present, i);
            let mut h = self.hidden.forward(input.view())?;
            gelu_inplace(&mut h);
            let mut g = self.gate.forward(h.view())?;
            sigmoid_inplace(&mut g);
            values.row_mut(i).assign(&g);
        }
        ensure_finite("gating", values.iter())?;

        Ok(GateValues {
            values,
            mode: self.mode,
        })
    }

    /// Gradient with respect to `context` given the gradient of the gate
    /// values. A view's gate also depends on the other present views
    /// through their mean, so each row spreads gradient to the others.
    pub fn backward(
        &self,
        context: ArrayView2<f32>,
        mask: &[bool],
        grad_values: ArrayView2<f32>,
        prefix: &str,
        grads: &mut GradientStore,
    ) -> FusionResult<Array2<f32>> {
        let slots = context.nrows();
        let hidden = context.ncols();
        let present = self.check(context, mask)?;
        if grad_values.dim() != (slots, self.gate.out_dim()) {
            return Err(FusionError::dimension(
                "gate gradient",
                slots * self.gate.out_dim(),
                grad_values.len(),
            ));
        }

        let hidden_prefix = param_name(prefix, "hidden");
        let gate_prefix = param_name(prefix, "gate");
        let others = present.len().saturating_sub(1);
        let mut d_context = Array2::<f32>::zeros((slots, hidden));
        for &i in &present {
            let input = gate_input(context, &present, i);
            let pre = self.hidden.forward(input.view())?;
            let activated = pre.mapv(gelu);
            let mut g = self.gate.forward(activated.view())?;
            sigmoid_inplace(&mut g);

            let d_gate_pre = &grad_values.row(i) * &g.mapv(sigmoid_grad_from_output);
            let d_activated =
                self.gate
                    .backward(activated.view(), d_gate_pre.view(), &gate_prefix, grads)?;
            let d_pre = d_activated * &pre.mapv(gelu_grad);
            let d_input = self
                .hidden
                .backward(input.view(), d_pre.view(), &hidden_prefix, grads)?;

            d_context
                .row_mut(i)
                .scaled_add(1.0, &d_input.slice(s![..hidden]));
            if others > 0 {
                let share = 1.0 / others as f32;
                for &j in &present {
                    if j != i {
                        d_context
                            .row_mut(j)
                            .scaled_add(share, &d_input.slice(s![hidden..]));
                    }
                }
            }
        }
        Ok(d_context)
    }
}

fn gate_width(config: &FusionConfig) -> usize {
    match config.gate_mode {
        GateMode::Scalar => 1,
        GateMode::Channel => config.hidden_dim,
    }
}

/// `[ctx_slot ; mean of the other present rows]`
fn gate_input(context: ArrayView2<f32>, present: &[usize], slot: usize) -> Array1<f32> {
    let summary = others_mean(context, present, slot);
    context.row(slot).iter().chain(summary.iter()).copied().collect()
}

/// Mean of the other present rows; zeros when `slot` is alone
fn others_mean(context: ArrayView2<f32>, present: &[usize], slot: usize) -> Array1<f32> {
    let mut summary = Array1::<f32>::zeros(context.ncols());
    let others = present.len() - 1;
    if others == 0 {
        return summary;
    }
    for &j in present {
        if j != slot {
            summary += &context.row(j);
        }
    }
    summary / others as f32
}

impl Parameterized for GatingNetwork {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>) {
        self.hidden.collect_parameters(&param_name(prefix, "hidden"), out);
        self.gate.collect_parameters(&param_name(prefix, "gate"), out);
    }

    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()> {
        self.hidden.load_parameters(&param_name(prefix, "hidden"), store)?;
        self.gate.load_parameters(&param_name(prefix, "gate"), store)
    }
}
