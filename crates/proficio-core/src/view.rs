//! Views and view sets
//!
//! A view is one camera's clip reduced to a single embedding by the
//! backbone. A sample holds an ordered sequence of view slots with an
//! explicit presence flag; absent slots are never read.

use crate::{CameraId, FusionError, FusionResult};

/// One camera slot of a sample
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    /// Which physical camera produced this slot
    pub camera: CameraId,
    /// Raw backbone embedding (ignored when absent)
    pub embedding: Option<Vec<f32>>,
    /// Does this slot carry real data?
    pub present: bool,
}

impl View {
    /// A present view carrying an embedding
    pub fn present(camera: CameraId, embedding: Vec<f32>) -> Self {
        Self {
            camera,
            embedding: Some(embedding),
            present: true,
        }
    }

    /// An absent slot
    pub fn absent(camera: CameraId) -> Self {
        Self {
            camera,
            embedding: None,
            present: false,
        }
    }

    /// Embedding of a present view, `None` for absent slots
    pub fn embedding(&self) -> Option<&[f32]> {
        if self.present {
            self.embedding.as_deref()
        } else {
            None
        }
    }
}

/// Ordered view slots of a single sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewSet {
    views: Vec<View>,
}

impl ViewSet {
    pub fn new(views: Vec<View>) -> Self {
        Self { views }
    }

    /// Build from `(camera, embedding)` pairs; `None` marks an absent slot
    pub fn from_slots(slots: Vec<(CameraId, Option<Vec<f32>>)>) -> Self {
        let views = slots
            .into_iter()
            .map(|(camera, embedding)| match embedding {
                Some(e) => View::present(camera, e),
                None => View::absent(camera),
            })
            .collect();
        Self { views }
    }

    pub fn push(&mut self, view: View) {
        self.views.push(view);
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn present_count(&self) -> usize {
        self.views.iter().filter(|v| v.present).count()
    }

    pub fn presence_mask(&self) -> Vec<bool> {
        self.views.iter().map(|v| v.present).collect()
    }

    /// Slot indices of present views, in input order
    pub fn present_indices(&self) -> Vec<usize> {
        self.views
            .iter()
            .enumerate()
            .filter(|(_, v)| v.present)
            .map(|(i, _)| i)
            .collect()
    }

    /// Reorder slots; `order[i]` is the source slot of new slot `i`
    pub fn permuted(&self, order: &[usize]) -> FusionResult<Self> {
        if order.len() != self.views.len() {
            return Err(FusionError::dimension(
                "permutation",
                self.views.len(),
                order.len(),
            ));
        }
        let mut seen = vec![false; order.len()];
        let mut views = Vec::with_capacity(order.len());
        for &src in order {
            if src >= self.views.len() || seen[src] {
                return Err(FusionError::Configuration(format!(
                    "invalid permutation entry {}",
                    src
                )));
            }
            seen[src] = true;
            views.push(self.views[src].clone());
        }
        Ok(Self { views })
    }

    /// Check the sample against the configured input dimension and view
    /// budget. Returns the present slot indices.
    ///
    /// Absent slots are skipped entirely, whatever they hold.
    pub fn validate(&self, input_dim: usize, max_views: usize) -> FusionResult<Vec<usize>> {
        if self.views.len() > max_views {
            return Err(FusionError::ViewCount {
                present: self.present_count(),
                slots: self.views.len(),
                max: max_views,
            });
        }

        let present = self.present_indices();
        if present.is_empty() {
            return Err(FusionError::ViewCount {
                present: 0,
                slots: self.views.len(),
                max: max_views,
            });
        }

        for &slot in &present {
            let embedding = self.views[slot].embedding.as_deref().unwrap_or(&[]);
            if embedding.len() != input_dim {
                return Err(FusionError::dimension(
                    format!("view {} embedding", slot),
                    input_dim,
                    embedding.len(),
                ));
            }
            if embedding.iter().any(|x| !x.is_finite()) {
                return Err(FusionError::NumericInstability {
                    stage: "input",
                    index: slot,
                });
            }
        }

        Ok(present)
    }
}

impl From<Vec<View>> for ViewSet {
    fn from(views: Vec<View>) -> Self {
        Self::new(views)
    }
}
