//! Gaussian random projection used to transplant weights across mismatched
//! dimensions while approximately preserving the source's variance.

use ndarray::{Array2, ArrayView2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;

/// Dimensionality-reducing linear map with Gaussian components.
///
/// Components are drawn from `N(0, 1/n_components)`; the transform is
/// `X · Cᵀ`, taking `[n, n_features]` to `[n, n_components]`. A fresh
/// component matrix is drawn on every call: the transfer engine deliberately
/// fits per tensor rather than reusing one projection across sub-calls.
pub struct GaussianProjection {
    n_components: usize,
}

impl GaussianProjection {
    pub fn new(n_components: usize) -> Self {
        assert!(n_components > 0, "projection needs at least one component");
        Self { n_components }
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    /// Draw a component matrix and project `x` along its feature axis.
    pub fn fit_transform(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let (_, n_features) = x.dim();
        let std = (1.0 / self.n_components as f32).sqrt();
        let components = Array2::random(
            (self.n_components, n_features),
            Normal::new(0.0_f32, std).unwrap(),
        );
        x.dot(&components.t())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_output_shape_follows_components() {
        let x = Array2::<f32>::ones((10, 32));

        let reduce = GaussianProjection::new(8);
        assert_eq!(reduce.fit_transform(&x.view()).dim(), (10, 8));

        let same = GaussianProjection::new(32);
        assert_eq!(same.fit_transform(&x.view()).dim(), (10, 32));
    }

    #[test]
    fn test_fresh_fit_per_call() {
        let x = Array2::from_shape_fn((6, 16), |(i, j)| ((i * 16 + j) % 11) as f32 * 0.2);
        let rp = GaussianProjection::new(4);

        let a = rp.fit_transform(&x.view());
        let b = rp.fit_transform(&x.view());
        // New components each call; projections of a non-zero input differ.
        assert!(a != b);
    }

    #[test]
    fn test_zero_input_stays_zero() {
        let x = Array2::<f32>::zeros((4, 8));
        let rp = GaussianProjection::new(3);
        let out = rp.fit_transform(&x.view());
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_variance_roughly_preserved() {
        // Johnson-Lindenstrauss flavored sanity check: the projected norm is
        // within a loose band of the original for a generous component count.
        let x = Array2::from_shape_fn((1, 256), |(_, j)| if j % 2 == 0 { 1.0 } else { -1.0 });
        let rp = GaussianProjection::new(128);
        let out = rp.fit_transform(&x.view());

        let norm_in: f32 = x.iter().map(|v| v * v).sum();
        let norm_out: f32 = out.iter().map(|v| v * v).sum();
        let ratio = norm_out / norm_in;
        assert!(ratio > 0.3 && ratio < 3.0, "norm ratio {} out of band", ratio);
    }
}
