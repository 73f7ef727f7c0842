//! Fixed spectral transforms used by the Fourier and cosine head variants.
//!
//! Naive O(n²) transforms over small per-head matrices. Inputs are
//! `[seq, dim]`; both transforms run along the feature axis first, then the
//! sequence axis, matching the composition the linear-transform heads expect.

use ndarray::{Array2, ArrayView2};

/// Real part of the 2-D discrete Fourier transform `Re(F_seq(F_feat(x)))`.
pub fn dft_2d_real(x: &ArrayView2<f32>) -> Array2<f32> {
    let (seq, dim) = x.dim();

    // DFT along the feature axis, complex intermediate.
    let mut re = Array2::<f32>::zeros((seq, dim));
    let mut im = Array2::<f32>::zeros((seq, dim));
    for n in 0..seq {
        for k in 0..dim {
            let mut sum_re = 0.0;
            let mut sum_im = 0.0;
            for m in 0..dim {
                let angle = -2.0 * std::f32::consts::PI * (m * k) as f32 / dim as f32;
                let v = x[[n, m]];
                sum_re += v * angle.cos();
                sum_im += v * angle.sin();
            }
            re[[n, k]] = sum_re;
            im[[n, k]] = sum_im;
        }
    }

    // DFT along the sequence axis; only the real part survives.
    let mut out = Array2::<f32>::zeros((seq, dim));
    for t in 0..seq {
        for k in 0..dim {
            let mut sum = 0.0;
            for n in 0..seq {
                let angle = -2.0 * std::f32::consts::PI * (n * t) as f32 / seq as f32;
                sum += re[[n, k]] * angle.cos() - im[[n, k]] * angle.sin();
            }
            out[[t, k]] = sum;
        }
    }
    out
}

/// Unnormalized DCT-II along one axis: `y_k = 2 Σ_n x_n cos(π (2n + 1) k / 2N)`.
fn dct_1d(x: &[f32], out: &mut [f32]) {
    let n_len = x.len();
    for (k, o) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (n, &v) in x.iter().enumerate() {
            let angle =
                std::f32::consts::PI * (2 * n + 1) as f32 * k as f32 / (2 * n_len) as f32;
            sum += v * angle.cos();
        }
        *o = 2.0 * sum;
    }
}

/// 2-D DCT-II: feature axis first, then sequence axis.
pub fn dct_2d(x: &ArrayView2<f32>) -> Array2<f32> {
    let (seq, dim) = x.dim();

    let mut stage = Array2::<f32>::zeros((seq, dim));
    let mut row_buf = vec![0.0_f32; dim];
    for n in 0..seq {
        let row: Vec<f32> = x.row(n).iter().copied().collect();
        dct_1d(&row, &mut row_buf);
        for k in 0..dim {
            stage[[n, k]] = row_buf[k];
        }
    }

    let mut out = Array2::<f32>::zeros((seq, dim));
    let mut col_buf = vec![0.0_f32; seq];
    let mut col_in = vec![0.0_f32; seq];
    for k in 0..dim {
        for n in 0..seq {
            col_in[n] = stage[[n, k]];
        }
        dct_1d(&col_in, &mut col_buf);
        for t in 0..seq {
            out[[t, k]] = col_buf[t];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_dft_constant_input_concentrates_at_dc() {
        // A constant [2, 2] matrix has all its energy in the DC bin.
        let x = arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        let out = dft_2d_real(&x.view());

        assert!((out[[0, 0]] - 4.0).abs() < 1e-4);
        assert!(out[[0, 1]].abs() < 1e-4);
        assert!(out[[1, 0]].abs() < 1e-4);
        assert!(out[[1, 1]].abs() < 1e-4);
    }

    #[test]
    fn test_dft_single_element() {
        let x = arr2(&[[3.0]]);
        let out = dft_2d_real(&x.view());
        assert!((out[[0, 0]] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_dft_is_linear() {
        let a = arr2(&[[1.0, -2.0], [0.5, 3.0]]);
        let b = arr2(&[[2.0, 0.0], [-1.0, 1.0]]);
        let sum = &a + &b;

        let out_sum = dft_2d_real(&sum.view());
        let out_a = dft_2d_real(&a.view());
        let out_b = dft_2d_real(&b.view());

        for i in 0..2 {
            for j in 0..2 {
                assert!((out_sum[[i, j]] - out_a[[i, j]] - out_b[[i, j]]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_dct_1d_known_values() {
        // scipy.fft.dct([1.0, 2.0, 3.0, 4.0], type=2, norm=None)
        // -> [20.0, -6.30864406, 0.0, -0.44834153]
        let x = [1.0, 2.0, 3.0, 4.0];
        let mut out = [0.0; 4];
        dct_1d(&x, &mut out);

        assert!((out[0] - 20.0).abs() < 1e-3);
        assert!((out[1] + 6.3086).abs() < 1e-3);
        assert!(out[2].abs() < 1e-3);
        assert!((out[3] + 0.4483).abs() < 1e-3);
    }

    #[test]
    fn test_dct_2d_shape_and_dc() {
        let x = arr2(&[[1.0, 1.0, 1.0], [1.0, 1.0, 1.0]]);
        let out = dct_2d(&x.view());

        assert_eq!(out.dim(), (2, 3));
        // DC term of unnormalized DCT-II over both axes: 2 * 2 * sum = 24.
        assert!((out[[0, 0]] - 24.0).abs() < 1e-3);
        // All non-DC terms vanish for constant input.
        assert!(out[[0, 1]].abs() < 1e-3);
        assert!(out[[1, 0]].abs() < 1e-3);
    }
}
