//! Proficio Test Harness - Fusion validation
//!
//! This crate provides:
//! - Seeded synthetic multi-view samples
//! - Property checks (simplex weights, order and mask invariance,
//!   determinism, single-view pass-through, gradient isolation)
//! - End-to-end integration runs including checkpoint round trips
//! - Short gradient-descent runs on synthetic batches

pub mod integration;
pub mod properties;
pub mod synthetic;

pub use integration::*;
pub use properties::*;
pub use synthetic::*;
