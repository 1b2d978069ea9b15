//! Camera identity
//!
//! A sample is recorded by one egocentric camera and zero or more
//! exocentric cameras. The identifier only labels where a view came from;
//! fusion weights are shared across cameras and never keyed on it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical camera identity (0 = egocentric, 1.. = exocentric)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CameraId(pub u16);

impl CameraId {
    pub const EGO: CameraId = CameraId(0);

    #[inline]
    pub fn new(id: u16) -> Self {
        CameraId(id)
    }

    /// Exocentric camera `n` (1-based)
    #[inline]
    pub fn exo(n: u16) -> Self {
        CameraId(n.max(1))
    }

    #[inline]
    pub fn is_ego(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        CameraId(u16::from_le_bytes(bytes))
    }
}

impl fmt::Debug for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ego() {
            write!(f, "Camera(ego)")
        } else {
            write!(f, "Camera(exo{})", self.0)
        }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ego() {
            write!(f, "ego")
        } else {
            write!(f, "exo{}", self.0)
        }
    }
}
