//! Fusion configuration
//!
//! The same configuration must be used for training and inference. It is
//! validated when a model is constructed, never lazily on the first
//! forward call.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{FusionError, FusionResult};

/// Shape of the per-view gate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// One relevance value per view
    Scalar,
    /// One relevance value per fusion channel
    #[default]
    Channel,
}

/// How gate and attention confidence are combined before renormalization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineRule {
    /// `ln(gate) + ln(confidence)`, i.e. a product after the softmax
    Product,
    /// `alpha * gate + beta * confidence` with trainable alpha, beta
    #[default]
    Learned,
}

/// Low-rank overlay on the view projector
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Rank of the A·B update
    pub rank: usize,
    /// Scale numerator; the update is scaled by `alpha / rank`
    pub alpha: f32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
        }
    }
}

/// Fusion model configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Backbone embedding dimension (D)
    pub input_dim: usize,

    /// Shared fusion space dimension (H)
    pub hidden_dim: usize,

    /// Attention heads; must divide `hidden_dim`
    pub num_heads: usize,

    /// Maximum view slots per sample (V_max)
    pub max_views: usize,

    /// Dropout rate applied in training mode only
    pub dropout: f32,

    /// Calibration temperature (low = near one-hot, high = near uniform)
    pub temperature: f32,

    /// Label-space cardinality
    pub num_classes: usize,

    pub gate_mode: GateMode,

    /// Width of the gating MLP
    pub gate_hidden_dim: usize,

    pub combine_rule: CombineRule,

    /// Emit a continuous proficiency score next to the logits
    pub regression_head: bool,

    pub layer_norm_eps: f32,

    /// Optional low-rank overlay on the projector weight
    pub projector_adapter: Option<AdapterConfig>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            input_dim: 768,
            hidden_dim: 512,
            num_heads: 16,
            max_views: 5,
            dropout: 0.1,
            temperature: 1.0,
            num_classes: 4,
            gate_mode: GateMode::Channel,
            gate_hidden_dim: 128,
            combine_rule: CombineRule::Learned,
            regression_head: false,
            layer_norm_eps: 1e-5,
            projector_adapter: None,
        }
    }
}

impl FusionConfig {
    /// TimeSformer-base backbone (768-d) fused at full width with 12 heads
    pub fn timesformer_base() -> Self {
        Self {
            input_dim: 768,
            hidden_dim: 768,
            num_heads: 12,
            gate_hidden_dim: 256,
            ..Default::default()
        }
    }

    /// Small model for tests and demos
    pub fn compact(input_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dim: 32,
            num_heads: 4,
            gate_hidden_dim: 16,
            ..Default::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads.max(1)
    }

    /// Reject malformed configurations
    pub fn validate(&self) -> FusionResult<()> {
        let fail = |msg: String| Err(FusionError::Configuration(msg));

        if self.input_dim == 0 {
            return fail("input_dim must be > 0".into());
        }
        if self.hidden_dim == 0 {
            return fail("hidden_dim must be > 0".into());
        }
        if self.num_heads == 0 {
            return fail("num_heads must be > 0".into());
        }
        if self.hidden_dim % self.num_heads != 0 {
            return fail(format!(
                "hidden_dim {} must be divisible by num_heads {}",
                self.hidden_dim, self.num_heads
            ));
        }
        if self.max_views == 0 {
            return fail("max_views must be >= 1".into());
        }
        if self.num_classes == 0 {
            return fail("num_classes must be >= 1".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout {} outside [0, 1)", self.dropout));
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return fail(format!("temperature {} must be finite and > 0", self.temperature));
        }
        if self.gate_hidden_dim == 0 {
            return fail("gate_hidden_dim must be > 0".into());
        }
        if !self.layer_norm_eps.is_finite() || self.layer_norm_eps <= 0.0 {
            return fail("layer_norm_eps must be finite and > 0".into());
        }
        if let Some(adapter) = &self.projector_adapter {
            let max_rank = self.input_dim.min(self.hidden_dim);
            if adapter.rank == 0 || adapter.rank > max_rank {
                return fail(format!(
                    "adapter rank {} outside 1..={}",
                    adapter.rank, max_rank
                ));
            }
            if !adapter.alpha.is_finite() {
                return fail("adapter alpha must be finite".into());
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> FusionResult<Self> {
        let config: FusionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> FusionResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> FusionResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> FusionResult<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
