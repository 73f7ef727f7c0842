//! Linear algebra operations shared across the attention and feed-forward blocks.

pub mod masks;

use faer::Parallelism;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Zip};

/// Plain 2D matmul: `[m, k] @ [k, n] -> [m, n]`.
#[inline]
pub fn matmul_2d(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (k2, n) = b.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let a_sl = a_s.as_slice().unwrap();
    let b_s = b.as_standard_layout();
    let b_sl = b_s.as_slice().unwrap();
    let c_sl = c.as_slice_mut().unwrap();

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_sl, m, k),
        faer::mat::from_row_major_slice(b_sl, k, n),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

/// 2D matmul against a weight matrix stored in `[out, in]` layout.
#[inline]
pub fn matmul_2d_transposed(a: &ArrayView2<f32>, b_transposed: &ArrayView2<f32>) -> Array2<f32> {
    let (m, k) = a.dim();
    let (n, k2) = b_transposed.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let a_sl = a_s.as_slice().unwrap();
    let b_s = b_transposed.as_standard_layout();
    let b_sl = b_s.as_slice().unwrap();
    let c_sl = c.as_slice_mut().unwrap();

    faer::linalg::matmul::matmul(
        faer::mat::from_row_major_slice_mut(c_sl, m, n),
        faer::mat::from_row_major_slice(a_sl, m, k),
        faer::mat::from_row_major_slice(b_sl, n, k).transpose(),
        None,
        1.0,
        Parallelism::Rayon(0),
    );
    c
}

/// Batched matmul for a 3D input and a `[out, in]` weight matrix.
#[inline]
pub fn matmul_3d_2d_transposed(a: &Array3<f32>, b_transposed: &Array2<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let (n, k2) = b_transposed.dim();
    assert_eq!(k, k2, "matmul inner dimensions do not match");

    let a_s = a.as_standard_layout();
    let a_flat = a_s.view().into_shape_with_order((batch * m, k)).unwrap();
    let c_flat = matmul_2d_transposed(&a_flat, &b_transposed.view());

    c_flat.into_shape_with_order((batch, m, n)).unwrap()
}

/// Batch-wise matmul: `[b, m, k] @ [b, k, n] -> [b, m, n]`.
///
/// Used for per-head scoring where each head slot runs through its own variant.
#[inline]
pub fn matmul_3d(a: &ArrayView3<f32>, b: &ArrayView3<f32>) -> Array3<f32> {
    let (batch, m, k) = a.dim();
    let n = b.shape()[2];
    assert_eq!(k, b.shape()[1], "matmul inner dimensions do not match");
    assert_eq!(batch, b.shape()[0], "batch sizes do not match");

    let mut output = Array3::<f32>::zeros((batch, m, n));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            let a_s = a_b.as_standard_layout();
            let b_s = b_b.as_standard_layout();
            let o_s = out_b.as_slice_mut().expect("output buffer must be contiguous");

            faer::linalg::matmul::matmul(
                faer::mat::from_row_major_slice_mut(o_s, m, n),
                faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), m, k),
                faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), k, n),
                None,
                1.0,
                Parallelism::None,
            );
        });

    output
}

/// Head-batched matmul: `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`.
#[inline]
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> Array4<f32> {
    let (batch, heads, seq1, dim) = a.dim();
    let seq2 = b.shape()[3];
    assert_eq!(dim, b.shape()[2], "matmul inner dimensions do not match");

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    let a_s = a_h.as_standard_layout();
                    let b_s = b_h.as_standard_layout();
                    let o_s = out_h.as_slice_mut().expect("output buffer must be contiguous");

                    faer::linalg::matmul::matmul(
                        faer::mat::from_row_major_slice_mut(o_s, seq1, seq2),
                        faer::mat::from_row_major_slice(a_s.as_slice().unwrap(), seq1, dim),
                        faer::mat::from_row_major_slice(b_s.as_slice().unwrap(), dim, seq2),
                        None,
                        1.0,
                        Parallelism::None, // no internal threads; we are already parallel
                    );
                });
        });

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3, Array4};

    fn assert_close(a: &[f32], b: &[f32], tol: f32, msg: &str) {
        assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
        for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
            assert!(
                (x - y).abs() <= tol,
                "{}: mismatch at {}: {} vs {}",
                msg,
                i,
                x,
                y
            );
        }
    }

    fn reference_matmul_2d(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
        let (m, k) = a.dim();
        let (_, n) = b.dim();
        let mut c = Array2::<f32>::zeros((m, n));
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a[[i, l]] * b[[l, j]];
                }
                c[[i, j]] = sum;
            }
        }
        c
    }

    #[test]
    fn test_matmul_2d_simple() {
        let a = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let result = matmul_2d(&a.view(), &b.view());
        let expected = reference_matmul_2d(&a, &b);

        assert_close(
            result.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            1e-5,
            "matmul_2d simple",
        );
    }

    #[test]
    fn test_matmul_2d_transposed_matches_reference() {
        let a = Array2::from_shape_fn((4, 8), |(i, j)| ((i + j) % 5) as f32 * 0.3);
        let b_t = Array2::from_shape_fn((6, 8), |(i, j)| ((i * j) % 7) as f32 * 0.1);

        let result = matmul_2d_transposed(&a.view(), &b_t.view());
        let expected = reference_matmul_2d(&a, &b_t.t().to_owned());

        assert_close(
            result.as_slice().unwrap(),
            expected.as_slice().unwrap(),
            1e-4,
            "matmul_2d_transposed",
        );
    }

    #[test]
    fn test_matmul_3d_2d_transposed_shape() {
        let a = Array3::from_shape_fn((2, 16, 64), |(b, s, h)| ((b + s + h) % 10) as f32 * 0.1);
        let w = Array2::from_shape_fn((128, 64), |(i, j)| ((i + j) % 7) as f32 * 0.01);

        let result = matmul_3d_2d_transposed(&a, &w);
        assert_eq!(result.dim(), (2, 16, 128));
    }

    #[test]
    fn test_matmul_3d_batches_independent() {
        let a = Array3::from_shape_fn((2, 3, 4), |(b, i, j)| (b * 12 + i * 4 + j) as f32);
        let b = Array3::from_shape_fn((2, 4, 5), |(b, i, j)| (b + i + j) as f32);

        let result = matmul_3d(&a.view(), &b.view());
        assert_eq!(result.dim(), (2, 3, 5));

        for batch in 0..2 {
            let a_b = a.index_axis(ndarray::Axis(0), batch).to_owned();
            let b_b = b.index_axis(ndarray::Axis(0), batch).to_owned();
            let expected = reference_matmul_2d(&a_b, &b_b);
            let got = result.index_axis(ndarray::Axis(0), batch);
            assert_close(
                got.to_owned().as_slice().unwrap(),
                expected.as_slice().unwrap(),
                1e-4,
                "matmul_3d batch",
            );
        }
    }

    #[test]
    fn test_matmul_4d_attention_shape() {
        let q = Array4::from_shape_fn((2, 4, 8, 16), |(b, h, s, d)| {
            ((b + h + s + d) % 10) as f32 * 0.1
        });
        let k_t = Array4::from_shape_fn((2, 4, 16, 8), |(b, h, d, s)| {
            ((b * h + d + s) % 7) as f32 * 0.1
        });

        let scores = matmul_4d(&q, &k_t);
        assert_eq!(scores.dim(), (2, 4, 8, 8));
    }
}
