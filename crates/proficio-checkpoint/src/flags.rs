//! Checkpoint flags
//!
//! Record which optional components the stored model carries. They must
//! agree with the embedded configuration.

use proficio_core::FusionConfig;

/// Checkpoint flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointFlags(pub u8);

impl CheckpointFlags {
    pub const NONE: CheckpointFlags = CheckpointFlags(0);

    // Flag bits
    pub const ADAPTER: u8 = 0b0000_0001;
    pub const REGRESSION: u8 = 0b0000_0010;
    pub const KNOWN: u8 = Self::ADAPTER | Self::REGRESSION;

    #[inline]
    pub fn new(bits: u8) -> Self {
        CheckpointFlags(bits)
    }

    pub fn for_config(config: &FusionConfig) -> Self {
        let mut flags = Self::NONE;
        flags.set_adapter(config.projector_adapter.is_some());
        flags.set_regression(config.regression_head);
        flags
    }

    #[inline]
    pub fn has_adapter(self) -> bool {
        self.0 & Self::ADAPTER != 0
    }

    #[inline]
    pub fn has_regression(self) -> bool {
        self.0 & Self::REGRESSION != 0
    }

    /// Any bit this version does not understand
    #[inline]
    pub fn has_unknown(self) -> bool {
        self.0 & !Self::KNOWN != 0
    }

    #[inline]
    pub fn set_adapter(&mut self, value: bool) {
        if value {
            self.0 |= Self::ADAPTER;
        } else {
            self.0 &= !Self::ADAPTER;
        }
    }

    #[inline]
    pub fn set_regression(&mut self, value: bool) {
        if value {
            self.0 |= Self::REGRESSION;
        } else {
            self.0 &= !Self::REGRESSION;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proficio_core::AdapterConfig;

    #[test]
    fn test_flags_from_config() {
        let plain = FusionConfig::compact(8);
        assert_eq!(CheckpointFlags::for_config(&plain), CheckpointFlags::NONE);

        let full = FusionConfig {
            regression_head: true,
            projector_adapter: Some(AdapterConfig::default()),
            ..FusionConfig::compact(8)
        };
        let flags = CheckpointFlags::for_config(&full);
        assert!(flags.has_adapter());
        assert!(flags.has_regression());
        assert!(!flags.has_unknown());
    }

    #[test]
    fn test_unknown_bits() {
        assert!(CheckpointFlags::new(0b1000_0000).has_unknown());
        let mut flags = CheckpointFlags::new(CheckpointFlags::KNOWN);
        flags.set_adapter(false);
        assert_eq!(flags.0, CheckpointFlags::REGRESSION);
    }
}
