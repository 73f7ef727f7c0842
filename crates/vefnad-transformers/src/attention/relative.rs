//! Learned relative-position bias shared by all heads of a layer.

use anyhow::Result;
use ndarray::{Array2, Array4};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;

use crate::config::PositionEmbeddingType;

/// Distance-indexed embedding table added to raw attention scores.
///
/// The table covers distances in `[-(max_positions - 1), max_positions - 1]`;
/// indices are clamped so sequences longer than `max_positions` cannot run off
/// either end.
pub struct DistanceEmbedding {
    pub table: Array2<f32>, // [2 * max_positions - 1, head_dim]
    pub max_positions: usize,
    pub mode: PositionEmbeddingType,
}

impl DistanceEmbedding {
    pub fn init(
        max_positions: usize,
        head_dim: usize,
        initializer_range: f32,
        mode: PositionEmbeddingType,
    ) -> Self {
        assert!(mode.is_relative(), "absolute positions carry no distance table");
        Self {
            table: Array2::random(
                (2 * max_positions - 1, head_dim),
                Normal::new(0.0_f32, initializer_range).unwrap(),
            ),
            max_positions,
            mode,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.table.shape()[1]
    }

    fn bucket(&self, query_pos: usize, key_pos: usize) -> usize {
        let distance = query_pos as i64 - key_pos as i64;
        let index = distance + self.max_positions as i64 - 1;
        index.clamp(0, 2 * self.max_positions as i64 - 2) as usize
    }

    /// Add the bias into raw scores `[batch, heads, seq_q, seq_k]`.
    ///
    /// `past_len` offsets the absolute query positions during cached decoding.
    /// Key-query mode additionally folds in the key-side term.
    pub fn add_scores(
        &self,
        scores: &mut Array4<f32>,
        q: &Array4<f32>,
        k: &Array4<f32>,
        past_len: usize,
    ) -> Result<()> {
        let (batch, heads, seq_q, seq_k) = scores.dim();
        let dim = self.head_dim();
        anyhow::ensure!(
            q.shape()[3] == dim && k.shape()[3] == dim,
            "distance embedding width {} does not match head_dim {}",
            dim,
            q.shape()[3]
        );

        for b in 0..batch {
            for h in 0..heads {
                for l in 0..seq_q {
                    for r in 0..seq_k {
                        let bucket = self.bucket(l + past_len, r);
                        let emb = self.table.row(bucket);

                        let mut bias = 0.0;
                        for d in 0..dim {
                            bias += q[[b, h, l, d]] * emb[d];
                        }
                        if self.mode == PositionEmbeddingType::RelativeKeyQuery {
                            for d in 0..dim {
                                bias += k[[b, h, r, d]] * emb[d];
                            }
                        }
                        scores[[b, h, l, r]] += bias;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_bucket_clamps_long_sequences() {
        let emb = DistanceEmbedding::init(4, 2, 0.02, PositionEmbeddingType::RelativeKey);
        // max index is 2 * 4 - 2 = 6.
        assert_eq!(emb.bucket(100, 0), 6);
        assert_eq!(emb.bucket(0, 100), 0);
        assert_eq!(emb.bucket(2, 2), 3);
    }

    #[test]
    fn test_key_query_mode_adds_key_term() {
        let mut emb = DistanceEmbedding::init(4, 1, 0.02, PositionEmbeddingType::RelativeKey);
        emb.table.fill(1.0);

        let q = Array4::<f32>::ones((1, 1, 2, 1));
        let k = Array4::<f32>::from_elem((1, 1, 2, 1), 2.0);

        let mut key_only = Array4::<f32>::zeros((1, 1, 2, 2));
        emb.add_scores(&mut key_only, &q, &k, 0).unwrap();
        assert!((key_only[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);

        emb.mode = PositionEmbeddingType::RelativeKeyQuery;
        let mut both = Array4::<f32>::zeros((1, 1, 2, 2));
        emb.add_scores(&mut both, &q, &k, 0).unwrap();
        assert!((both[[0, 0, 0, 0]] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_offset_shifts_query_position() {
        let mut emb = DistanceEmbedding::init(8, 1, 0.02, PositionEmbeddingType::RelativeKey);
        for (i, mut row) in emb.table.outer_iter_mut().enumerate() {
            row.fill(i as f32);
        }

        let q = Array4::<f32>::ones((1, 1, 1, 1));
        let k = Array4::<f32>::ones((1, 1, 4, 1));

        let mut scores = Array4::<f32>::zeros((1, 1, 1, 4));
        emb.add_scores(&mut scores, &q, &k, 3).unwrap();

        // Query at absolute position 3: distances 3, 2, 1, 0 -> buckets 10, 9, 8, 7.
        assert_eq!(scores[[0, 0, 0, 0]], 10.0);
        assert_eq!(scores[[0, 0, 0, 3]], 7.0);
    }
}
