//! Fuse a few synthetic ego/exo samples and print the per-camera weights.
//!
//! ```text
//! RUST_LOG=proficio_fusion=debug cargo run -p proficio-fusion --example fuse_views
//! ```

use proficio_core::{CameraId, FusionConfig, FusionResult, View, ViewSet};
use proficio_fusion::FusionModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn embedding(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn main() -> FusionResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FusionConfig::compact(64);
    let model = FusionModel::seeded(config.clone(), 42)?;
    let mut rng = StdRng::seed_from_u64(7);

    let cameras = [
        CameraId::EGO,
        CameraId::exo(1),
        CameraId::exo(2),
        CameraId::exo(3),
        CameraId::exo(4),
    ];

    for present in 1..=config.max_views {
        let views: Vec<View> = cameras
            .iter()
            .enumerate()
            .map(|(slot, &camera)| {
                if slot < present {
                    View::present(camera, embedding(&mut rng, config.input_dim))
                } else {
                    View::absent(camera)
                }
            })
            .collect();

        let out = model.fuse(&ViewSet::new(views))?;
        let weights: Vec<String> = out
            .cameras
            .iter()
            .zip(&out.weights)
            .map(|(camera, w)| format!("{}={:.3}", camera, w))
            .collect();
        println!(
            "{} view(s): class {} [{}]",
            present,
            out.predicted_class(),
            weights.join(", ")
        );
    }
    Ok(())
}
