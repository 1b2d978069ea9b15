//! Named parameter registry
//!
//! Every module exposes its weights as dot-named tensors
//! (`attention.q.weight`, `head.classifier.bias`, ...). Checkpoints are a
//! flat list of these; loading matches by name and checks shapes.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::{Array1, Array2};
use proficio_core::{FusionError, FusionResult};

/// A flat tensor with a name and shape
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    /// False for frozen base weights under a low-rank overlay
    pub trainable: bool,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>, trainable: bool) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
            trainable,
        }
    }

    pub fn from_array1(name: impl Into<String>, array: &Array1<f32>, trainable: bool) -> Self {
        Self::new(name, vec![array.len()], array.to_vec(), trainable)
    }

    pub fn from_array2(name: impl Into<String>, array: &Array2<f32>, trainable: bool) -> Self {
        Self::new(
            name,
            array.shape().to_vec(),
            array.iter().copied().collect(),
            trainable,
        )
    }

    pub fn scalar(name: impl Into<String>, value: f32, trainable: bool) -> Self {
        Self::new(name, Vec::new(), vec![value], trainable)
    }

    /// Element count implied by the shape
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Join a module prefix and a parameter name
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Tensors indexed by name
#[derive(Debug, Clone, Default)]
pub struct TensorStore {
    tensors: BTreeMap<String, NamedTensor>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensors(tensors: impl IntoIterator<Item = NamedTensor>) -> Self {
        Self {
            tensors: tensors.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn insert(&mut self, tensor: NamedTensor) {
        self.tensors.insert(tensor.name.clone(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn require(&self, name: &str, expected: &[usize]) -> FusionResult<&NamedTensor> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| FusionError::MissingTensor(name.to_string()))?;
        if tensor.shape != expected || tensor.data.len() != tensor.numel() {
            return Err(FusionError::TensorShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        Ok(tensor)
    }

    /// Overwrite `target` with the stored tensor of the same shape
    pub fn load_array1(&self, name: &str, target: &mut Array1<f32>) -> FusionResult<()> {
        let tensor = self.require(name, &[target.len()])?;
        target.assign(&Array1::from_vec(tensor.data.clone()));
        Ok(())
    }

    pub fn load_array2(&self, name: &str, target: &mut Array2<f32>) -> FusionResult<()> {
        let shape = target.dim();
        let tensor = self.require(name, &[shape.0, shape.1])?;
        let array = Array2::from_shape_vec(shape, tensor.data.clone()).map_err(|e| {
            FusionError::InvalidCheckpoint(format!("{}: {}", name, e))
        })?;
        target.assign(&array);
        Ok(())
    }

    pub fn load_scalar(&self, name: &str) -> FusionResult<f32> {
        let tensor = self.require(name, &[])?;
        Ok(tensor.data[0])
    }
}

/// Modules that own named parameters
pub trait Parameterized {
    /// Append this module's tensors under `prefix`
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedTensor>);

    /// Overwrite this module's tensors from `store`
    fn load_parameters(&mut self, prefix: &str, store: &TensorStore) -> FusionResult<()>;

    fn parameter_summary(&self) -> ParameterSummary {
        let mut tensors = Vec::new();
        self.collect_parameters("", &mut tensors);
        ParameterSummary::from_tensors(&tensors)
    }
}

/// Parameter counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParameterSummary {
    pub total: usize,
    pub trainable: usize,
}

impl ParameterSummary {
    pub fn from_tensors(tensors: &[NamedTensor]) -> Self {
        let mut summary = ParameterSummary::default();
        for t in tensors {
            summary.total += t.data.len();
            if t.trainable {
                summary.trainable += t.data.len();
            }
        }
        summary
    }

    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trainable: {} | Total: {} | %: {:.2}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}
