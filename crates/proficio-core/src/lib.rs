//! Proficio Core - Fundamental types shared by every proficio crate
//!
//! This crate defines:
//! - Camera identifiers (ego / exo)
//! - Views, presence masks and per-sample view sets
//! - Proficiency labels
//! - Fusion configuration
//! - The common error type

pub mod config;
pub mod error;
pub mod id;
pub mod label;
pub mod view;

pub use config::*;
pub use error::*;
pub use id::*;
pub use label::*;
pub use view::*;
