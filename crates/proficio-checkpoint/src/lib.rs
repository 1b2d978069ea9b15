//! Proficio Checkpoint - Binary parameter format
//!
//! A checkpoint is laid out as:
//! - Fixed header (24 bytes)
//! - Configuration (JSON)
//! - Named tensors
//! - SHA-256 trailer over everything before it

pub mod codec;
pub mod file;
pub mod flags;
pub mod header;

pub use codec::*;
pub use file::*;
pub use flags::*;
pub use header::*;
