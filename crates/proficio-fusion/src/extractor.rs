//! Backbone seam
//!
//! The fusion model never sees pixels. Anything that can turn one camera's
//! clip into a single embedding can feed it.

use proficio_core::{CameraId, FusionError, FusionResult, View, ViewSet};

use crate::{FusionModel, FusionOutput};

/// Per-view feature extraction
pub trait FeatureExtractor {
    /// Whatever the extractor consumes for one camera
    type Clip;

    /// Width of the produced embedding
    fn embedding_dim(&self) -> usize;

    /// Reduce one clip to an embedding of `embedding_dim()` values
    fn extract_view_features(&self, clip: &Self::Clip) -> FusionResult<Vec<f32>>;

    /// Build a view set; `None` clips become absent slots
    fn extract_views(&self, clips: &[(CameraId, Option<Self::Clip>)]) -> FusionResult<ViewSet> {
        let mut views = ViewSet::default();
        for (camera, clip) in clips {
            let view = match clip {
                Some(clip) => View::present(*camera, self.extract_view_features(clip)?),
                None => View::absent(*camera),
            };
            views.push(view);
        }
        Ok(views)
    }
}

impl FusionModel {
    /// Extract every present clip and fuse the result
    pub fn fuse_clips<E: FeatureExtractor>(
        &self,
        extractor: &E,
        clips: &[(CameraId, Option<E::Clip>)],
    ) -> FusionResult<FusionOutput> {
        if extractor.embedding_dim() != self.config().input_dim {
            return Err(FusionError::dimension(
                "extractor embedding",
                self.config().input_dim,
                extractor.embedding_dim(),
            ));
        }
        let views = extractor.extract_views(clips)?;
        self.fuse(&views)
    }
}
