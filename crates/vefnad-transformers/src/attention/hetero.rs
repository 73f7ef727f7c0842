//! Heterogeneous attention: every head slot of a layer may run a different
//! operator, combined into one stacked score/context pipeline.

use anyhow::{Result, bail};
use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, Axis};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Uniform;

use crate::config::{HeadKind, HeadSpec, ModelConfig, Similarity, SpectralTransform};
use crate::dense::Dense;
use crate::dropout::Dropout;
use crate::ops::{matmul_3d, matmul_4d};
use crate::spectral::{dct_2d, dft_2d_real};

use super::conv::ConvHead;
use super::relative::DistanceEmbedding;
use super::{
    BlockOutput, attention_probs, merge_heads, project_key_value, transpose_for_scores,
};

/// Operator and parameters of one head slot.
pub enum HeadOp {
    DotProduct,
    Bilinear { w: Array2<f32> },
    Spectral(SpectralTransform),
    Conv(ConvHead),
}

impl HeadOp {
    pub fn init(spec: &HeadSpec, initializer_range: f32) -> Self {
        match spec.kind {
            HeadKind::SelfAttention(Similarity::DotProduct) => HeadOp::DotProduct,
            HeadKind::SelfAttention(Similarity::Bilinear) => HeadOp::Bilinear {
                w: Array2::random(
                    (spec.head_dim, spec.head_dim),
                    Uniform::new(-0.1_f32, 0.1),
                ),
            },
            HeadKind::Spectral(transform) => HeadOp::Spectral(transform),
            HeadKind::Conv { kernel_size } => {
                HeadOp::Conv(ConvHead::init(spec.head_dim, kernel_size, initializer_range))
            }
        }
    }

    pub fn kind(&self) -> HeadKind {
        match self {
            HeadOp::DotProduct => HeadKind::SelfAttention(Similarity::DotProduct),
            HeadOp::Bilinear { .. } => HeadKind::SelfAttention(Similarity::Bilinear),
            HeadOp::Spectral(t) => HeadKind::Spectral(*t),
            HeadOp::Conv(head) => HeadKind::Conv {
                kernel_size: head.kernel_size,
            },
        }
    }

    fn scores_are_learned(&self) -> bool {
        matches!(self, HeadOp::DotProduct | HeadOp::Bilinear { .. })
    }
}

/// Per-layer heterogeneous attention block. Q/K/V projections and the
/// relative-position bias are shared; each head slot dispatches to its own
/// operator.
pub struct HeteroAttention {
    pub query: Dense,
    pub key: Dense,
    pub value: Dense,
    pub heads: Vec<HeadOp>,
    pub head_dim: usize,
    pub relative: Option<DistanceEmbedding>,
    pub dropout: Dropout,
}

impl HeteroAttention {
    pub fn init(
        config: &ModelConfig,
        specs: &[HeadSpec],
        hidden: usize,
        relative: Option<DistanceEmbedding>,
    ) -> Self {
        let head_dim = specs[0].head_dim;
        let all_head_size = specs.len() * head_dim;
        Self {
            query: Dense::init(hidden, all_head_size, config.initializer_range),
            key: Dense::init(hidden, all_head_size, config.initializer_range),
            value: Dense::init(hidden, all_head_size, config.initializer_range),
            heads: specs
                .iter()
                .map(|spec| HeadOp::init(spec, config.initializer_range))
                .collect(),
            head_dim,
            relative,
            dropout: Dropout::new(config.attention_probs_dropout_prob),
        }
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }

    pub fn all_head_size(&self) -> usize {
        self.heads.len() * self.head_dim
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
        let (batch, seq_q, _) = hidden_states.dim();
        let num_heads = self.heads.len();

        let q = self.query.forward_3d(hidden_states)?;
        let kv = project_key_value(
            &self.key,
            &self.value,
            hidden_states,
            encoder_hidden_states,
            past_kv,
        )?;
        let seq_k = kv.full_k.shape()[1];

        let q4 = transpose_for_scores(&q, num_heads, self.head_dim)?;
        let k4 = transpose_for_scores(&kv.full_k, num_heads, self.head_dim)?;
        let v4 = transpose_for_scores(&kv.full_v, num_heads, self.head_dim)?;

        // Per-head raw scores; heads without a similarity operator contribute
        // an all-zero placeholder so the stacked tensor stays uniform.
        let mut scores = Array4::<f32>::zeros((batch, num_heads, seq_q, seq_k));
        for (j, op) in self.heads.iter().enumerate() {
            if !op.scores_are_learned() {
                continue;
            }
            let q_head = q4.index_axis(Axis(1), j);
            let k_head_t = k4.index_axis(Axis(1), j).permuted_axes([0, 2, 1]);

            let head_scores = match op {
                HeadOp::DotProduct => matmul_3d(&q_head, &k_head_t),
                HeadOp::Bilinear { w } => {
                    let rotated = rotate_query(&q_head, w)?;
                    matmul_3d(&rotated.view(), &k_head_t)
                }
                _ => unreachable!(),
            };
            scores.index_axis_mut(Axis(1), j).assign(&head_scores);
        }

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

        let attn_context = matmul_4d(&probs, &v4);

        // Assemble per-head contexts: similarity heads keep their softmax
        // context, spectral and conv heads add their contribution on top of
        // the uniform-softmax context of their slot.
        let mut merged = Array4::<f32>::zeros((batch, num_heads, seq_q, self.head_dim));
        for (j, op) in self.heads.iter().enumerate() {
            let base = attn_context.index_axis(Axis(1), j);
            let mut slot = merged.index_axis_mut(Axis(1), j);

            match op {
                HeadOp::DotProduct | HeadOp::Bilinear { .. } => {
                    slot.assign(&base);
                }
                HeadOp::Spectral(transform) => {
                    if seq_q != seq_k {
                        bail!(
                            "spectral heads do not support cached decoding \
                             (query length {} != key length {})",
                            seq_q,
                            seq_k
                        );
                    }
                    slot.assign(&base);
                    for b in 0..batch {
                        let v_head = v4.index_axis(Axis(0), b);
                        let v_head = v_head.index_axis(Axis(0), j);
                        let transformed = match transform {
                            SpectralTransform::Fourier => dft_2d_real(&v_head),
                            SpectralTransform::Cosine => dct_2d(&v_head),
                        };
                        let mut out = slot.index_axis_mut(Axis(0), b);
                        out += &transformed;
                    }
                }
                HeadOp::Conv(conv) => {
                    if seq_q != seq_k {
                        bail!(
                            "conv heads do not support cached decoding \
                             (query length {} != key length {})",
                            seq_q,
                            seq_k
                        );
                    }
                    let conv_out = conv.forward(
                        &q4.index_axis(Axis(1), j),
                        &k4.index_axis(Axis(1), j),
                        &v4.index_axis(Axis(1), j),
                    )?;
                    slot.assign(&(&base + &conv_out));
                }
            }
        }

        Ok(BlockOutput {
            context: merge_heads(merged)?,
            probs: output_attentions.then_some(probs),
            new_kv: kv.new_kv,
        })
    }
}

/// Apply the bilinear matrix to a per-head query slice.
fn rotate_query(q_head: &ndarray::ArrayView3<f32>, w: &Array2<f32>) -> Result<Array3<f32>> {
    let (batch, seq, dim) = q_head.dim();
    let flat = q_head
        .to_owned()
        .into_shape_with_order((batch * seq, dim))?;
    Ok(crate::ops::matmul_2d(&flat.view(), &w.view())
        .into_shape_with_order((batch, seq, dim))?)
}
