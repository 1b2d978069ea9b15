//! Checkpoint files

use std::fs;
use std::path::Path;

use proficio_core::FusionResult;
use proficio_fusion::{FusionModel, ModelSnapshot};

use crate::{decode_snapshot, encode_snapshot};

/// Write `model` at training step `step`
///
/// The file is written next to its destination and renamed into place, so
/// a crash never leaves a half-written checkpoint under `path`.
pub fn save_checkpoint(path: impl AsRef<Path>, model: &FusionModel, step: u64) -> FusionResult<()> {
    let path = path.as_ref();
    let snapshot = model.snapshot(step);
    let bytes = encode_snapshot(&snapshot)?;

    let staging = path.with_extension("partial");
    fs::write(&staging, &bytes)?;
    fs::rename(&staging, path)?;

    tracing::info!(
        path = %path.display(),
        step,
        bytes = bytes.len(),
        tensors = snapshot.tensors.len(),
        "checkpoint saved"
    );
    Ok(())
}

/// Read and verify a checkpoint without building the model
pub fn load_snapshot(path: impl AsRef<Path>) -> FusionResult<ModelSnapshot> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let snapshot = decode_snapshot(&bytes)?;
    tracing::debug!(path = %path.display(), step = snapshot.step, "checkpoint decoded");
    Ok(snapshot)
}

/// Load a model and the step it was saved at
pub fn load_checkpoint(path: impl AsRef<Path>) -> FusionResult<(FusionModel, u64)> {
    let path = path.as_ref();
    let snapshot = load_snapshot(path)?;
    let model = FusionModel::restore(&snapshot)?;
    tracing::info!(path = %path.display(), step = snapshot.step, "checkpoint loaded");
    Ok((model, snapshot.step))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proficio_core::{CameraId, FusionConfig, FusionError, View, ViewSet};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_resumes_identically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fusion.pfck");

        let model = FusionModel::seeded(FusionConfig::compact(6), 3).unwrap();
        save_checkpoint(&path, &model, 4200).unwrap();
        assert!(!path.with_extension("partial").exists());

        let (restored, step) = load_checkpoint(&path).unwrap();
        assert_eq!(step, 4200);
        assert_eq!(restored, model);

        let views = ViewSet::new(vec![
            View::present(CameraId::EGO, vec![0.2, -0.1, 0.4, 0.0, 0.9, -0.7]),
            View::present(CameraId::exo(1), vec![0.5; 6]),
        ]);
        assert_eq!(restored.fuse(&views).unwrap(), model.fuse(&views).unwrap());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path().join("absent.pfck")),
            Err(FusionError::Io(_))
        ));
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fusion.pfck");
        let model = FusionModel::seeded(FusionConfig::compact(6), 4).unwrap();
        save_checkpoint(&path, &model, 1).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert_eq!(load_snapshot(&path), Err(FusionError::ChecksumMismatch));
    }
}
