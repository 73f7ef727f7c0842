//! Convolutional attention head: local mixing through a depthwise-separable
//! convolution and a dynamically predicted softmax kernel.

use anyhow::{Result, ensure};
use ndarray::{Array1, Array2, Array3, ArrayView3};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;

use crate::activations::softmax_3d_inplace;
use crate::dense::Dense;

/// Depthwise convolution over the sequence axis followed by a pointwise
/// channel mix. Keeps sequence length for odd kernels (`padding = k / 2`).
pub struct SeparableConv1d {
    pub depthwise: Array2<f32>, // [channels, kernel]
    pub pointwise: Array2<f32>, // [out_channels, in_channels]
    pub bias: Array1<f32>,      // [out_channels]
    pub kernel_size: usize,
}

impl SeparableConv1d {
    pub fn init(channels: usize, kernel_size: usize, initializer_range: f32) -> Self {
        let dist = Normal::new(0.0_f32, initializer_range).unwrap();
        Self {
            depthwise: Array2::random((channels, kernel_size), dist),
            pointwise: Array2::random((channels, channels), dist),
            bias: Array1::zeros(channels),
            kernel_size,
        }
    }

    /// Input and output are `[batch, seq, channels]`.
    pub fn forward(&self, x: &ArrayView3<f32>) -> Array3<f32> {
        let (batch, seq, channels) = x.dim();
        let pad = self.kernel_size / 2;

        // Depthwise: each channel convolved with its own kernel, zero padded.
        let mut mixed = Array3::<f32>::zeros((batch, seq, channels));
        for b in 0..batch {
            for t in 0..seq {
                for c in 0..channels {
                    let mut sum = 0.0;
                    for k in 0..self.kernel_size {
                        let pos = t + k;
                        if pos >= pad && pos - pad < seq {
                            sum += x[[b, pos - pad, c]] * self.depthwise[[c, k]];
                        }
                    }
                    mixed[[b, t, c]] = sum;
                }
            }
        }

        // Pointwise 1x1 mix plus bias.
        let mut out = Array3::<f32>::zeros((batch, seq, self.pointwise.shape()[0]));
        for b in 0..batch {
            for t in 0..seq {
                for oc in 0..self.pointwise.shape()[0] {
                    let mut sum = self.bias[oc];
                    for ic in 0..channels {
                        sum += mixed[[b, t, ic]] * self.pointwise[[oc, ic]];
                    }
                    out[[b, t, oc]] = sum;
                }
            }
        }
        out
    }
}

/// Light-weight dynamic convolution head.
///
/// Keys pass through the separable convolution, combine multiplicatively with
/// the query, and predict a per-position softmax weighting over kernel taps
/// which is applied to an unfolded linear projection of the values.
pub struct ConvHead {
    pub key_conv: SeparableConv1d,
    pub kernel_dense: Dense, // head_dim -> kernel_size
    pub out_dense: Dense,    // head_dim -> head_dim
    pub kernel_size: usize,
}

impl ConvHead {
    pub fn init(head_dim: usize, kernel_size: usize, initializer_range: f32) -> Self {
        Self {
            key_conv: SeparableConv1d::init(head_dim, kernel_size, initializer_range),
            kernel_dense: Dense::init(head_dim, kernel_size, initializer_range),
            out_dense: Dense::init(head_dim, head_dim, initializer_range),
            kernel_size,
        }
    }

    /// Per-head forward; all inputs are `[batch, seq, head_dim]`.
    pub fn forward(
        &self,
        query: &ArrayView3<f32>,
        key: &ArrayView3<f32>,
        value: &ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        let (batch, seq, head_dim) = query.dim();
        ensure!(
            key.dim() == (batch, seq, head_dim) && value.dim() == (batch, seq, head_dim),
            "conv head requires aligned query/key/value sequences"
        );

        let key_mixed = self.key_conv.forward(key);

        // Multiplicative query gating, then kernel prediction.
        let gated = &key_mixed * &query.to_owned();
        let gated_2d = gated
            .as_standard_layout()
            .into_shape_with_order((batch * seq, head_dim))?
            .to_owned();
        let kernel_logits = self.kernel_dense.forward_2d(&gated_2d.view());
        let mut kernel = kernel_logits
            .into_shape_with_order((batch, seq, self.kernel_size))?;
        softmax_3d_inplace(&mut kernel);

        // Unfold the projected values and contract against the kernel.
        let value_2d = value
            .to_owned()
            .into_shape_with_order((batch * seq, head_dim))?;
        let projected = self
            .out_dense
            .forward_2d(&value_2d.view())
            .into_shape_with_order((batch, seq, head_dim))?;

        let pad = (self.kernel_size - 1) / 2;
        let mut out = Array3::<f32>::zeros((batch, seq, head_dim));
        for b in 0..batch {
            for t in 0..seq {
                for c in 0..head_dim {
                    let mut sum = 0.0;
                    for k in 0..self.kernel_size {
                        let pos = t + k;
                        if pos >= pad && pos - pad < seq {
                            sum += projected[[b, pos - pad, c]] * kernel[[b, t, k]];
                        }
                    }
                    out[[b, t, c]] = sum;
                }
            }
        }
        Ok(out)
    }
}

/// Nearest-neighbor resampling of a depthwise kernel along the tap axis,
/// used when transferring between conv heads of different kernel sizes.
pub fn resample_kernel(kernel: &Array2<f32>, new_size: usize) -> Array2<f32> {
    let (channels, old_size) = kernel.dim();
    let mut out = Array2::<f32>::zeros((channels, new_size));
    for c in 0..channels {
        for k in 0..new_size {
            let src = k * old_size / new_size;
            out[[c, k]] = kernel[[c, src]];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    #[test]
    fn test_separable_conv_identity_kernel() {
        // Depthwise delta kernel + identity pointwise = identity.
        let mut conv = SeparableConv1d::init(2, 3, 0.02);
        conv.depthwise.fill(0.0);
        conv.depthwise[[0, 1]] = 1.0;
        conv.depthwise[[1, 1]] = 1.0;
        conv.pointwise.fill(0.0);
        conv.pointwise[[0, 0]] = 1.0;
        conv.pointwise[[1, 1]] = 1.0;

        let x = Array3::from_shape_fn((1, 4, 2), |(_, s, c)| (s * 2 + c) as f32);
        let out = conv.forward(&x.view());

        for s in 0..4 {
            for c in 0..2 {
                assert!((out[[0, s, c]] - x[[0, s, c]]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_separable_conv_zero_pads_edges() {
        let mut conv = SeparableConv1d::init(1, 3, 0.02);
        // Averaging kernel over a constant signal: edges see one padded zero.
        conv.depthwise.fill(1.0);
        conv.pointwise.fill(1.0);

        let x = Array3::<f32>::ones((1, 5, 1));
        let out = conv.forward(&x.view());

        assert!((out[[0, 2, 0]] - 3.0).abs() < 1e-6);
        assert!((out[[0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((out[[0, 4, 0]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_conv_head_shape_and_finite() {
        let head = ConvHead::init(8, 3, 0.02);
        let q = Array3::<f32>::ones((2, 6, 8));
        let k = Array3::<f32>::ones((2, 6, 8));
        let v = Array3::<f32>::ones((2, 6, 8));

        let out = head.forward(&q.view(), &k.view(), &v.view()).unwrap();
        assert_eq!(out.dim(), (2, 6, 8));
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_conv_head_rejects_mismatched_sequences() {
        let head = ConvHead::init(4, 3, 0.02);
        let q = Array3::<f32>::ones((1, 2, 4));
        let k = Array3::<f32>::ones((1, 5, 4));
        let v = Array3::<f32>::ones((1, 5, 4));
        assert!(head.forward(&q.view(), &k.view(), &v.view()).is_err());
    }

    #[test]
    fn test_resample_kernel_nearest() {
        let kernel = arr2(&[[1.0, 2.0, 3.0, 4.0, 5.0]]);
        let down = resample_kernel(&kernel, 3);
        assert_eq!(down, arr2(&[[1.0, 2.0, 4.0]]));

        let same = resample_kernel(&kernel, 5);
        assert_eq!(same, kernel);
    }
}
