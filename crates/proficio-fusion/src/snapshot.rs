//! Parameter snapshots
//!
//! A snapshot captures everything needed to rebuild a model: its
//! configuration, every named tensor, and the training step counter.

use proficio_core::{FusionConfig, FusionResult};
use proficio_nn::{NamedTensor, ParameterSummary, Parameterized, TensorStore};

use crate::FusionModel;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub config: FusionConfig,
    pub step: u64,
    pub tensors: Vec<NamedTensor>,
}

impl ModelSnapshot {
    pub fn summary(&self) -> ParameterSummary {
        ParameterSummary::from_tensors(&self.tensors)
    }

    pub fn tensor(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

impl FusionModel {
    pub fn snapshot(&self, step: u64) -> ModelSnapshot {
        let mut tensors = Vec::new();
        self.collect_parameters("", &mut tensors);
        ModelSnapshot {
            config: self.config().clone(),
            step,
            tensors,
        }
    }

    /// Rebuild a model from a snapshot
    ///
    /// Every tensor the configuration implies must be present with the
    /// right shape. Unknown tensors are ignored.
    pub fn restore(snapshot: &ModelSnapshot) -> FusionResult<Self> {
        let mut model = FusionModel::zeroed(snapshot.config.clone())?;
        let store = TensorStore::from_tensors(snapshot.tensors.iter().cloned());
        model.load_parameters("", &store)?;

        let mut loaded = Vec::new();
        model.collect_parameters("", &mut loaded);
        if store.len() > loaded.len() {
            tracing::warn!(
                stored = store.len(),
                used = loaded.len(),
                "snapshot carries tensors the model does not use"
            );
        }
        tracing::info!(
            step = snapshot.step,
            "model restored: {}",
            ParameterSummary::from_tensors(&loaded)
        );
        Ok(model)
    }
}
