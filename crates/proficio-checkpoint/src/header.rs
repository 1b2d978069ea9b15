//! Fixed checkpoint header
//!
//! Fixed header is 24 bytes:
//! - Bytes 0-3: Magic "PFCK"
//! - Byte 4: Format version
//! - Byte 5: Flags
//! - Bytes 6-7: Reserved (zero)
//! - Bytes 8-15: Training step (LE)
//! - Bytes 16-19: Tensor count (LE)
//! - Bytes 20-23: Configuration length in bytes (LE)

use proficio_core::{FusionError, FusionResult};

use crate::CheckpointFlags;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 24;

/// File magic
pub const MAGIC: [u8; 4] = *b"PFCK";

/// Current checkpoint format version
pub const FORMAT_VERSION: u8 = 1;

/// Fixed header structure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Format version
    pub version: u8,
    /// Optional components present in the model
    pub flags: CheckpointFlags,
    /// Training step at which the checkpoint was taken
    pub step: u64,
    /// Number of tensor records
    pub tensor_count: u32,
    /// Length of the JSON configuration block
    pub config_len: u32,
}

impl CheckpointHeader {
    pub fn new(flags: CheckpointFlags, step: u64, tensor_count: u32, config_len: u32) -> Self {
        CheckpointHeader {
            version: FORMAT_VERSION,
            flags,
            step,
            tensor_count,
            config_len,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &[u8]) -> FusionResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(FusionError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        // Bytes 0-3: Magic
        if buf[0..4] != MAGIC {
            return Err(FusionError::InvalidCheckpoint("bad magic".into()));
        }

        // Byte 4: Version
        let version = buf[4];
        if version != FORMAT_VERSION {
            return Err(FusionError::InvalidCheckpoint(format!(
                "unsupported format version {}",
                version
            )));
        }

        // Byte 5: Flags
        let flags = CheckpointFlags::new(buf[5]);
        if flags.has_unknown() {
            return Err(FusionError::InvalidCheckpoint(format!(
                "unknown flags {:#04x}",
                flags.0
            )));
        }

        // Bytes 6-7: Reserved
        if buf[6] != 0 || buf[7] != 0 {
            return Err(FusionError::InvalidCheckpoint("reserved bytes set".into()));
        }

        // Bytes 8-15: Step
        let mut step = [0u8; 8];
        step.copy_from_slice(&buf[8..16]);

        // Bytes 16-19: Tensor count
        let tensor_count = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);

        // Bytes 20-23: Config length
        let config_len = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);

        Ok(CheckpointHeader {
            version,
            flags,
            step: u64::from_le_bytes(step),
            tensor_count,
            config_len,
        })
    }

    /// Serialize header into a fixed-size array
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version;
        buf[5] = self.flags.0;
        buf[8..16].copy_from_slice(&self.step.to_le_bytes());
        buf[16..20].copy_from_slice(&self.tensor_count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.config_len.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CheckpointHeader {
        CheckpointHeader::new(
            CheckpointFlags::new(CheckpointFlags::REGRESSION),
            0xDEAD_BEEF_0042,
            37,
            512,
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let header = header();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], b"PFCK");
        assert_eq!(CheckpointHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_too_short() {
        let buf = [0u8; 20];
        assert!(matches!(
            CheckpointHeader::parse(&buf),
            Err(FusionError::BufferTooShort { expected: 24, actual: 20 })
        ));
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut bytes = header().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            CheckpointHeader::parse(&bytes),
            Err(FusionError::InvalidCheckpoint(_))
        ));

        let mut bytes = header().to_bytes();
        bytes[4] = FORMAT_VERSION + 1;
        assert!(matches!(
            CheckpointHeader::parse(&bytes),
            Err(FusionError::InvalidCheckpoint(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_flags_and_reserved() {
        let mut bytes = header().to_bytes();
        bytes[5] = 0x80;
        assert!(CheckpointHeader::parse(&bytes).is_err());

        let mut bytes = header().to_bytes();
        bytes[7] = 1;
        assert!(CheckpointHeader::parse(&bytes).is_err());
    }
}
