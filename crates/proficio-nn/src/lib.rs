//! Proficio NN - Small dense building blocks for view fusion
//!
//! Everything here is a plain function of its inputs and parameters:
//! - Linear layers and the low-rank adapter overlay
//! - Layer normalization and activations
//! - Masked softmax
//! - Dropout driven by a caller-supplied rng
//! - Named parameter registry for checkpoints
//! - Backward passes accumulating into a named gradient store

pub mod activation;
pub mod adapter;
pub mod dropout;
pub mod grad;
pub mod init;
pub mod linear;
pub mod norm;
pub mod numeric;
pub mod param;
pub mod softmax;

pub use activation::*;
pub use adapter::*;
pub use dropout::*;
pub use grad::*;
pub use init::*;
pub use linear::*;
pub use norm::*;
pub use numeric::*;
pub use param::*;
pub use softmax::*;
