//! Finite-value checks between stages
//!
//! Non-finite activations are reported, never patched: the caller decides
//! whether to skip the batch or abort.

use proficio_core::{FusionError, FusionResult};

/// Fail with `NumericInstability` on the first NaN or infinity
pub fn ensure_finite<'a>(
    stage: &'static str,
    values: impl IntoIterator<Item = &'a f32>,
) -> FusionResult<()> {
    match values.into_iter().position(|v| !v.is_finite()) {
        None => Ok(()),
        Some(index) => {
            tracing::warn!(stage, index, "non-finite activation detected");
            Err(FusionError::NumericInstability { stage, index })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_ok() {
        assert!(ensure_finite("projector", &[0.0f32, 1.0, -2.5]).is_ok());
        assert!(ensure_finite("projector", &[] as &[f32]).is_ok());
    }

    #[test]
    fn test_reports_first_bad_index() {
        let err = ensure_finite("attention", &[0.0, f32::NAN, f32::INFINITY]).unwrap_err();
        assert_eq!(
            err,
            FusionError::NumericInstability {
                stage: "attention",
                index: 1
            }
        );
    }
}
