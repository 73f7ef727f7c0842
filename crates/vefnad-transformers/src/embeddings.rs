//! Word, position and token-type embeddings.

use anyhow::{Result, bail};
use ndarray::{Array2, Array3};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;

use crate::config::{ModelConfig, PositionEmbeddingType};
use crate::dropout::Dropout;
use crate::normalization::LayerNorm;

/// Embedding lookup feeding the first encoder layer.
pub struct Embeddings {
    pub word_embeddings: Array2<f32>,       // [vocab, hidden]
    pub position_embeddings: Array2<f32>,   // [max_positions, hidden]
    pub token_type_embeddings: Array2<f32>, // [type_vocab, hidden]
    pub layer_norm: LayerNorm,
    pub dropout: Dropout,
    position_embedding_type: PositionEmbeddingType,
}

impl Embeddings {
    /// Random initialization from the config; the padding token row is zeroed.
    pub fn init(config: &ModelConfig) -> Self {
        let hidden = config.hidden_dims[0];
        let dist = Normal::new(0.0_f32, config.initializer_range).unwrap();

        let mut word_embeddings = Array2::random((config.vocab_size, hidden), dist);
        if config.pad_token_id < config.vocab_size {
            word_embeddings
                .row_mut(config.pad_token_id)
                .fill(0.0);
        }

        Self {
            word_embeddings,
            position_embeddings: Array2::random(
                (config.max_position_embeddings, hidden),
                dist,
            ),
            token_type_embeddings: Array2::random((config.type_vocab_size, hidden), dist),
            layer_norm: LayerNorm::init(hidden, config.layer_norm_eps),
            dropout: Dropout::new(config.hidden_dropout_prob),
            position_embedding_type: config.position_embedding_type,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.word_embeddings.shape()[1]
    }

    /// Look up and combine embeddings.
    ///
    /// `past_len` offsets the absolute position ids during cached decoding.
    pub fn forward(
        &self,
        input_ids: &Array2<usize>,
        token_type_ids: Option<&Array2<usize>>,
        past_len: usize,
        training: bool,
    ) -> Result<Array3<f32>> {
        let (batch, seq_len) = input_ids.dim();
        let hidden = self.hidden_size();
        let vocab = self.word_embeddings.shape()[0];

        let mut embeddings = Array3::<f32>::zeros((batch, seq_len, hidden));
        for b in 0..batch {
            for s in 0..seq_len {
                let id = input_ids[[b, s]];
                if id >= vocab {
                    bail!("input id {} out of vocabulary range {}", id, vocab);
                }
                let type_id = token_type_ids.map_or(0, |t| t[[b, s]]);
                if type_id >= self.token_type_embeddings.shape()[0] {
                    bail!("token type id {} out of range", type_id);
                }
                for h in 0..hidden {
                    embeddings[[b, s, h]] = self.word_embeddings[[id, h]]
                        + self.token_type_embeddings[[type_id, h]];
                }
            }
        }

        self.finish(embeddings, past_len, training)
    }

    /// Combine caller-provided input embeddings with position and token-type
    /// embeddings, bypassing the word table.
    pub fn forward_embeds(
        &self,
        inputs_embeds: &Array3<f32>,
        token_type_ids: Option<&Array2<usize>>,
        past_len: usize,
        training: bool,
    ) -> Result<Array3<f32>> {
        let (batch, seq_len, hidden) = inputs_embeds.dim();
        if hidden != self.hidden_size() {
            bail!(
                "input embeddings width {} does not match model width {}",
                hidden,
                self.hidden_size()
            );
        }

        let mut embeddings = inputs_embeds.clone();
        for b in 0..batch {
            for s in 0..seq_len {
                let type_id = token_type_ids.map_or(0, |t| t[[b, s]]);
                if type_id >= self.token_type_embeddings.shape()[0] {
                    bail!("token type id {} out of range", type_id);
                }
                for h in 0..hidden {
                    embeddings[[b, s, h]] += self.token_type_embeddings[[type_id, h]];
                }
            }
        }

        self.finish(embeddings, past_len, training)
    }

    fn finish(
        &self,
        mut embeddings: Array3<f32>,
        past_len: usize,
        training: bool,
    ) -> Result<Array3<f32>> {
        let (batch, seq_len, hidden) = embeddings.dim();
        if self.position_embedding_type == PositionEmbeddingType::Absolute {
            let max_positions = self.position_embeddings.shape()[0];
            if past_len + seq_len > max_positions {
                bail!(
                    "sequence of length {} at offset {} exceeds max position embeddings {}",
                    seq_len,
                    past_len,
                    max_positions
                );
            }
            for b in 0..batch {
                for s in 0..seq_len {
                    let pos = past_len + s;
                    for h in 0..hidden {
                        embeddings[[b, s, h]] += self.position_embeddings[[pos, h]];
                    }
                }
            }
        }

        let mut out = self.layer_norm.forward_3d(&embeddings);
        self.dropout.forward_3d(&mut out, training);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use ndarray::arr2;

    fn small_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 10,
            type_vocab_size: 2,
            max_position_embeddings: 8,
            hidden_dims: vec![4],
            ff_dims: vec![vec![8]],
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_forward_shape() {
        let embeddings = Embeddings::init(&small_config());
        let ids = arr2(&[[1_usize, 2, 3], [4, 5, 6]]);

        let out = embeddings.forward(&ids, None, 0, false).unwrap();
        assert_eq!(out.dim(), (2, 3, 4));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_out_of_vocab_rejected() {
        let embeddings = Embeddings::init(&small_config());
        let ids = arr2(&[[42_usize]]);
        assert!(embeddings.forward(&ids, None, 0, false).is_err());
    }

    #[test]
    fn test_position_overflow_rejected() {
        let embeddings = Embeddings::init(&small_config());
        let ids = arr2(&[[1_usize, 2, 3]]);
        assert!(embeddings.forward(&ids, None, 7, false).is_err());
    }

    #[test]
    fn test_pad_row_zeroed() {
        let config = small_config();
        let embeddings = Embeddings::init(&config);
        assert!(embeddings
            .word_embeddings
            .row(config.pad_token_id)
            .iter()
            .all(|&v| v == 0.0));
    }

    #[test]
    fn test_token_types_shift_output() {
        let embeddings = Embeddings::init(&small_config());
        let ids = arr2(&[[1_usize]]);
        let types_a = arr2(&[[0_usize]]);
        let types_b = arr2(&[[1_usize]]);

        let out_a = embeddings.forward(&ids, Some(&types_a), 0, false).unwrap();
        let out_b = embeddings.forward(&ids, Some(&types_b), 0, false).unwrap();
        assert!(out_a != out_b);
    }
}
