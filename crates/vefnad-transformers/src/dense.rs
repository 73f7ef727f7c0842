//! Dense (fully connected) layer.

use anyhow::Result;
use ndarray::{Array1, Array2, Array3, ArrayView2};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;

use crate::ops::{matmul_2d_transposed, matmul_3d_2d_transposed};

/// A dense layer with weights in `[out_features, in_features]` layout.
pub struct Dense {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Dense {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        if let Some(b) = &bias {
            assert_eq!(weight.shape()[0], b.len(), "bias length must match out_features");
        }
        Self { weight, bias }
    }

    /// Random initialization: weights from `N(0, std)`, bias zeroed.
    pub fn init(in_features: usize, out_features: usize, std: f32) -> Self {
        let weight = Array2::random(
            (out_features, in_features),
            Normal::new(0.0_f32, std).unwrap(),
        );
        Self {
            weight,
            bias: Some(Array1::zeros(out_features)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn forward_2d(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let mut out = matmul_2d_transposed(x, &self.weight.view());
        if let Some(bias) = &self.bias {
            out = out + bias;
        }
        out
    }

    pub fn forward_3d(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let mut out = matmul_3d_2d_transposed(x, &self.weight);
        if let Some(bias) = &self.bias {
            out = out + bias;
        }
        Ok(out)
    }
}
