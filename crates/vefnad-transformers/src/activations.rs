//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, expf, tanhf};
use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluNew,
    Relu,
    Tanh,
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" => Ok(Activation::GeluNew),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(format!("unknown activation function: {}", s)),
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Gelu
    }
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    const SQRT_2_INV: f32 = 0.7071067811865475;
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.7978845608;
    const GELU_COEFF: f32 = 0.044715;
    let x_cubed = x * x * x;
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x_cubed);
    0.5 * x * (1.0 + tanhf(inner))
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn tanh_scalar(x: f32) -> f32 {
    tanhf(x)
}

fn apply_activation_slice(slice: &mut [f32], activation: Activation) {
    match activation {
        Activation::Gelu => slice.iter_mut().for_each(|x| *x = gelu_scalar(*x)),
        Activation::GeluNew => slice.iter_mut().for_each(|x| *x = gelu_new_scalar(*x)),
        Activation::Relu => slice.iter_mut().for_each(|x| *x = relu_scalar(*x)),
        Activation::Tanh => slice.iter_mut().for_each(|x| *x = tanh_scalar(*x)),
    }
}

/// Apply an activation function in place to a 2D tensor.
pub fn apply_activation_2d(x: &mut Array2<f32>, activation: Activation) {
    if let Some(slice) = x.as_slice_mut() {
        apply_activation_slice(slice, activation);
    } else {
        x.mapv_inplace(|v| activate_scalar(v, activation));
    }
}

/// Apply an activation function in place to a 3D tensor.
pub fn apply_activation_3d(x: &mut Array3<f32>, activation: Activation) {
    if let Some(slice) = x.as_slice_mut() {
        apply_activation_slice(slice, activation);
    } else {
        x.mapv_inplace(|v| activate_scalar(v, activation));
    }
}

#[inline]
fn activate_scalar(x: f32, activation: Activation) -> f32 {
    match activation {
        Activation::Gelu => gelu_scalar(x),
        Activation::GeluNew => gelu_new_scalar(x),
        Activation::Relu => relu_scalar(x),
        Activation::Tanh => tanh_scalar(x),
    }
}

/// Numerically stable softmax over the last axis of a stacked score tensor.
///
/// Each `[query, key]` row of each head is normalized independently; heads never
/// mix, so placeholder all-zero score rows come out uniform without disturbing
/// the real similarity heads stacked next to them.
pub fn softmax_4d_inplace(x: &mut Array4<f32>) {
    for mut batch in x.outer_iter_mut() {
        for mut head in batch.outer_iter_mut() {
            for mut row in head.outer_iter_mut() {
                let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let mut sum = 0.0;
                for v in row.iter_mut() {
                    *v = expf(*v - max);
                    sum += *v;
                }
                if sum > 0.0 {
                    for v in row.iter_mut() {
                        *v /= sum;
                    }
                }
            }
        }
    }
}

/// Softmax over the last axis of a 3D tensor.
pub fn softmax_3d_inplace(x: &mut Array3<f32>) {
    for mut batch in x.outer_iter_mut() {
        for mut row in batch.outer_iter_mut() {
            let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = expf(*v - max);
                sum += *v;
            }
            if sum > 0.0 {
                for v in row.iter_mut() {
                    *v /= sum;
                }
            }
        }
    }
}
