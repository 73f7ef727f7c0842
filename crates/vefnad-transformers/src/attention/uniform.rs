//! Homogeneous attention blocks: every head runs the same operator.

use anyhow::{Result, bail};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;

use crate::config::{ModelConfig, SpectralTransform};
use crate::dense::Dense;
use crate::dropout::Dropout;
use crate::ops::{matmul_2d, matmul_4d};
use crate::spectral::{dct_2d, dft_2d_real};

use super::relative::DistanceEmbedding;
use super::{
    BlockOutput, attention_probs, merge_heads, project_key_value, transpose_for_scores,
};

/// Classic multi-head self-attention with a dot-product or learned bilinear
/// similarity shared by all heads of the layer.
pub struct UniformSelfAttention {
    pub query: Dense,
    pub key: Dense,
    pub value: Dense,
    /// Bilinear similarity matrix; `None` selects the plain dot product.
    pub w: Option<Array2<f32>>,
    pub num_heads: usize,
    pub head_dim: usize,
    pub relative: Option<DistanceEmbedding>,
    pub dropout: Dropout,
}

impl UniformSelfAttention {
    pub fn init(
        config: &ModelConfig,
        hidden: usize,
        num_heads: usize,
        bilinear: bool,
        relative: Option<DistanceEmbedding>,
    ) -> Self {
        let head_dim = hidden / num_heads;
        let all_head_size = num_heads * head_dim;
        Self {
            query: Dense::init(hidden, all_head_size, config.initializer_range),
            key: Dense::init(hidden, all_head_size, config.initializer_range),
            value: Dense::init(hidden, all_head_size, config.initializer_range),
            w: bilinear.then(|| {
                Array2::random((head_dim, head_dim), Uniform::new(-0.1_f32, 0.1))
            }),
            num_heads,
            head_dim,
            relative,
            dropout: Dropout::new(config.attention_probs_dropout_prob),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&Array1<f32>>,
        encoder_hidden_states: Option<&Array3<f32>>,
        past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
        output_attentions: bool,
        training: bool,
    ) -> Result<BlockOutput> {
        let q = self.query.forward_3d(hidden_states)?;
        let kv = project_key_value(
            &self.key,
            &self.value,
            hidden_states,
            encoder_hidden_states,
            past_kv,
        )?;

        let q4 = transpose_for_scores(&q, self.num_heads, self.head_dim)?;
        let k4 = transpose_for_scores(&kv.full_k, self.num_heads, self.head_dim)?;
        let v4 = transpose_for_scores(&kv.full_v, self.num_heads, self.head_dim)?;

        // Bilinear similarity rotates the query once; the same W serves every
        // head of the layer.
        let scored_q = match &self.w {
            Some(w) => {
                let (batch, heads, seq, dim) = q4.dim();
                let flat = q4
                    .as_standard_layout()
                    .into_shape_with_order((batch * heads * seq, dim))?
                    .to_owned();
                matmul_2d(&flat.view(), &w.view())
                    .into_shape_with_order((batch, heads, seq, dim))?
            }
            None => q4.clone(),
        };

        let k4_t = k4
            .view()
            .permuted_axes([0, 1, 3, 2])
            .as_standard_layout()
            .to_owned();
        let scores = matmul_4d(&scored_q, &k4_t);

        let probs = attention_probs(
            scores,
            self.relative.as_ref(),
            &q4,
            &k4,
            self.head_dim,
            attention_mask,
            &self.dropout,
            head_mask,
            kv.past_len,
            training,
        )?;

        let context = matmul_4d(&probs, &v4);
        Ok(BlockOutput {
            context: merge_heads(context)?,
            probs: output_attentions.then_some(probs),
            new_kv: kv.new_kv,
        })
    }
}

/// Homogeneous linear-transform attention: a fixed spectral transform of the
/// layer input replaces learned similarity scoring. The zero score tensor
/// still runs through bias/mask/softmax so relative encodings participate.
pub struct SpectralAttention {
    pub query: Dense,
    pub key: Dense,
    pub value: Dense,
    pub transform: SpectralTransform,
    pub num_heads: usize,
    pub head_dim: usize,
    pub relative: Option<DistanceEmbedding>,
    pub dropout: Dropout,
}

impl SpectralAttention {
    pub fn init(
        config: &ModelConfig,
        hidden: usize,
        num_heads: usize,
        transform: SpectralTransform,
        relative: Option<DistanceEmbedding>,
    ) -> Self {
        let head_dim = hidden / num_heads;
        let all_head_size = num_heads * head_dim;
        Self {
            query: Dense::init(hidden, all_head_size, config.initializer_range),
            key: Dense::init(hidden, all_head_size, config.initializer_range),
            value: Dense::init(hidden, all_head_size, config.initializer_range),
            transform,
            num_heads,
            head_dim,
            relative,
            dropout: Dropout::new(config.attention_probs_dropout_prob),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&Array1<f32>>,
        encoder_hidden_states: Option<&Array3<f32>>,
        past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
        output_attentions: bool,
        training: bool,
    ) -> Result<BlockOutput> {
        let (batch, seq_q, hidden) = hidden_states.dim();
        let all_head_size = self.num_heads * self.head_dim;
        if all_head_size != hidden {
            bail!(
                "spectral layers require all_head_size {} to equal hidden width {}",
                all_head_size,
                hidden
            );
        }

        let q = self.query.forward_3d(hidden_states)?;
        let kv = project_key_value(
            &self.key,
            &self.value,
            hidden_states,
            encoder_hidden_states,
            past_kv,
        )?;
        let seq_k = kv.full_k.shape()[1];

        let q4 = transpose_for_scores(&q, self.num_heads, self.head_dim)?;
        let k4 = transpose_for_scores(&kv.full_k, self.num_heads, self.head_dim)?;
        let v4 = transpose_for_scores(&kv.full_v, self.num_heads, self.head_dim)?;

        let scores = Array4::<f32>::zeros((batch, self.num_heads, seq_q, seq_k));
        let probs = attention_probs(
            scores,
            self.relative.as_ref(),
            &q4,
            &k4,
            self.head_dim,
            attention_mask,
            &self.dropout,
            head_mask,
            kv.past_len,
            training,
        )?;

        let mut context = merge_heads(matmul_4d(&probs, &v4))?;

        // Fixed orthogonal transform of the layer input, added on top of the
        // uniform-softmax context.
        for b in 0..batch {
            let slab = hidden_states.index_axis(Axis(0), b);
            let transformed = match self.transform {
                SpectralTransform::Fourier => dft_2d_real(&slab),
                SpectralTransform::Cosine => dct_2d(&slab),
            };
            let mut out_slab = context.index_axis_mut(Axis(0), b);
            out_slab += &transformed;
        }

        Ok(BlockOutput {
            context,
            probs: output_attentions.then_some(probs),
            new_kv: kv.new_kv,
        })
    }
}
