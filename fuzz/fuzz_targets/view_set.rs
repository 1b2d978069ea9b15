#![no_main]

use std::sync::OnceLock;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use proficio_core::{CameraId, FusionConfig, FusionError, View, ViewSet};
use proficio_fusion::FusionModel;

const INPUT_DIM: usize = 8;

#[derive(Debug, Arbitrary)]
struct Slot {
    camera: u16,
    present: bool,
    embedding: Option<Vec<f32>>,
}

fn model() -> &'static FusionModel {
    static MODEL: OnceLock<FusionModel> = OnceLock::new();
    MODEL.get_or_init(|| {
        FusionModel::seeded(FusionConfig::compact(INPUT_DIM), 0).expect("compact config is valid")
    })
}

fuzz_target!(|slots: Vec<Slot>| {
    let views = ViewSet::new(
        slots
            .into_iter()
            .map(|s| View {
                camera: CameraId::new(s.camera),
                embedding: s.embedding,
                present: s.present,
            })
            .collect(),
    );

    match model().fuse(&views) {
        Ok(out) => {
            let sum: f32 = out.weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert_eq!(out.weights.len(), views.present_count());
        }
        Err(FusionError::ViewCount { .. })
        | Err(FusionError::DimensionMismatch { .. })
        | Err(FusionError::NumericInstability { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }
});
