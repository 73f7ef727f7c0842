//! Inverted dropout, inert outside of training.

use ndarray::{Array3, Array4};
use rand::Rng;

/// Stochastic zeroing with inverted scaling. A no-op unless `training` is set,
/// so inference paths pay nothing.
pub struct Dropout {
    pub prob: f32,
}

impl Dropout {
    pub fn new(prob: f32) -> Self {
        assert!((0.0..1.0).contains(&prob), "dropout prob must be in [0, 1)");
        Self { prob }
    }

    pub fn forward_3d(&self, x: &mut Array3<f32>, training: bool) {
        if !training || self.prob == 0.0 {
            return;
        }
        let scale = 1.0 / (1.0 - self.prob);
        let mut rng = rand::thread_rng();
        x.mapv_inplace(|v| {
            if rng.r#gen::<f32>() < self.prob {
                0.0
            } else {
                v * scale
            }
        });
    }

    pub fn forward_4d(&self, x: &mut Array4<f32>, training: bool) {
        if !training || self.prob == 0.0 {
            return;
        }
        let scale = 1.0 / (1.0 - self.prob);
        let mut rng = rand::thread_rng();
        x.mapv_inplace(|v| {
            if rng.r#gen::<f32>() < self.prob {
                0.0
            } else {
                v * scale
            }
        });
    }
}
