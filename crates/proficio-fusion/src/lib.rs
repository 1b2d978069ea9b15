//! Proficio Fusion - Multi-view feature fusion
//!
//! Turns a variable set of per-camera embeddings into one fixed-size
//! representation and a proficiency prediction.
//!
//! # Pipeline
//!
//! ```text
//! views ─► ViewProjector ─► CrossViewAttention ─► GatingNetwork
//!                                   │                   │
//!                                   └─ confidence ──► AdaptiveCalibration
//!                                                       │ weights
//!                                   FusionAggregator ◄──┘
//!                                          │
//!                                   ProficiencyHead ─► logits
//! ```
//!
//! Every stage takes the presence mask as part of its input. Absent slots
//! are never read, weights are shared across cameras, and no stage looks
//! at slot order, so any subset of up to `max_views` cameras can be fused
//! by the same parameters.
//!
//! `FusionModel::backward` replays a `FusionTrace` through every stage in
//! reverse and returns named parameter gradients plus input gradients.

pub mod aggregator;
pub mod attention;
pub mod calibration;
pub mod extractor;
pub mod gating;
pub mod gradient;
pub mod head;
pub mod model;
pub mod projector;
pub mod snapshot;

pub use aggregator::*;
pub use attention::*;
pub use calibration::*;
pub use extractor::*;
pub use gating::*;
pub use gradient::*;
pub use head::*;
pub use model::*;
pub use projector::*;
pub use snapshot::*;
