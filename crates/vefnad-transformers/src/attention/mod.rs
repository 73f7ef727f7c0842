//! Multi-head attention blocks: uniform, spectral and heterogeneous layouts.
//!
//! All blocks share one pipeline: project Q/K/V, split into heads, produce a
//! stacked `[batch, heads, seq_q, seq_k]` score tensor (zero placeholders for
//! heads that do not score), add the shared relative-position bias, scale,
//! mask, softmax, then assemble per-head contexts back to `all_head_size` and
//! project to the layer's hidden width with a residual layer norm.

pub mod conv;
pub mod hetero;
pub mod relative;
pub mod uniform;


use anyhow::{Result, bail};
use ndarray::{Array1, Array3, Array4, ArrayView3, Axis};

use crate::activations::softmax_4d_inplace;
use crate::config::{
    AttentionLayout, LayerAttention, ModelConfig, Similarity,
};
use crate::dense::Dense;
use crate::dropout::Dropout;
use crate::normalization::LayerNorm;

pub use conv::{ConvHead, SeparableConv1d};
pub use hetero::{HeadOp, HeteroAttention};
pub use relative::DistanceEmbedding;
pub use uniform::{SpectralAttention, UniformSelfAttention};

/// `[batch, seq, all_head_size]` -> `[batch, heads, seq, head_dim]`.
pub(crate) fn transpose_for_scores(
    x: &Array3<f32>,
    num_heads: usize,
    head_dim: usize,
) -> Result<Array4<f32>> {
    let (batch, seq, all) = x.dim();
    if all != num_heads * head_dim {
        bail!(
            "cannot split width {} into {} heads of size {}",
            all,
            num_heads,
            head_dim
        );
    }
    let split = x
        .to_owned()
        .into_shape_with_order((batch, seq, num_heads, head_dim))?;
    Ok(split
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .to_owned())
}

/// `[batch, heads, seq, head_dim]` -> `[batch, seq, all_head_size]`.
pub(crate) fn merge_heads(context: Array4<f32>) -> Result<Array3<f32>> {
    let (batch, heads, seq, head_dim) = context.dim();
    Ok(context
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_shape_with_order((batch, seq, heads * head_dim))?
        .to_owned())
}

/// Resolve full key/value tensors for one attention call.
///
/// Returns `(full_k, full_v, new_kv, past_len)` where `new_kv` is what the
/// caller may persist into its cache: the freshly projected portion for
/// decoder self-attention, the full encoder projection for cross-attention,
/// `None` when cached cross K/V were reused.
pub(crate) fn project_key_value(
    key: &Dense,
    value: &Dense,
    hidden_states: &Array3<f32>,
    encoder_hidden_states: Option<&Array3<f32>>,
    past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
) -> Result<KeyValueState> {
    match (encoder_hidden_states, past_kv) {
        // Cross-attention with cached encoder projections: reuse as-is.
        (Some(_), Some((k, v))) => Ok(KeyValueState {
            full_k: k.to_owned(),
            full_v: v.to_owned(),
            new_kv: None,
            past_len: 0,
        }),
        // Cross-attention, first call: project the encoder side once.
        (Some(encoder), None) => {
            let k = key.forward_3d(encoder)?;
            let v = value.forward_3d(encoder)?;
            Ok(KeyValueState {
                new_kv: Some((k.clone(), v.clone())),
                full_k: k,
                full_v: v,
                past_len: 0,
            })
        }
        // Decoder self-attention: monotonic append onto the cached axis.
        (None, Some((past_k, past_v))) => {
            let new_k = key.forward_3d(hidden_states)?;
            let new_v = value.forward_3d(hidden_states)?;
            let past_len = past_k.shape()[1];

            let full_k = ndarray::concatenate(Axis(1), &[past_k.view(), new_k.view()])?
                .as_standard_layout()
                .to_owned();
            let full_v = ndarray::concatenate(Axis(1), &[past_v.view(), new_v.view()])?
                .as_standard_layout()
                .to_owned();

            Ok(KeyValueState {
                full_k,
                full_v,
                new_kv: Some((new_k, new_v)),
                past_len,
            })
        }
        // Plain self-attention.
        (None, None) => {
            let k = key.forward_3d(hidden_states)?;
            let v = value.forward_3d(hidden_states)?;
            Ok(KeyValueState {
                new_kv: Some((k.clone(), v.clone())),
                full_k: k,
                full_v: v,
                past_len: 0,
            })
        }
    }
}

pub(crate) struct KeyValueState {
    pub full_k: Array3<f32>,
    pub full_v: Array3<f32>,
    pub new_kv: Option<(Array3<f32>, Array3<f32>)>,
    pub past_len: usize,
}

/// Shared tail of the scoring pipeline: relative bias, scaling, masking,
/// softmax, probability dropout and head masking.
///
/// The bias is added to the raw scores before the `1/sqrt(head_dim)` scaling
/// and the additive attention mask after it, preserving the reference order.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attention_probs(
    mut scores: Array4<f32>,
    relative: Option<&DistanceEmbedding>,
    q: &Array4<f32>,
    k: &Array4<f32>,
    head_dim: usize,
    attention_mask: Option<&Array4<f32>>,
    dropout: &Dropout,
    head_mask: Option<&Array1<f32>>,
    past_len: usize,
    training: bool,
) -> Result<Array4<f32>> {
    if let Some(rel) = relative {
        rel.add_scores(&mut scores, q, k, past_len)?;
    }

    let scale = 1.0 / (head_dim as f32).sqrt();
    scores.mapv_inplace(|v| v * scale);

    if let Some(mask) = attention_mask {
        scores = scores + mask;
    }

    softmax_4d_inplace(&mut scores);
    dropout.forward_4d(&mut scores, training);

    if let Some(mask) = head_mask {
        if mask.len() != scores.shape()[1] {
            bail!(
                "head mask length {} does not match head count {}",
                mask.len(),
                scores.shape()[1]
            );
        }
        for (h, mut head) in scores.axis_iter_mut(Axis(1)).enumerate() {
            head.mapv_inplace(|v| v * mask[h]);
        }
    }

    Ok(scores)
}

/// Output half of an attention block: project `all_head_size` back to the
/// hidden width, then residual add and layer norm.
pub struct AttentionOutput {
    pub dense: Dense,
    pub layer_norm: LayerNorm,
    pub dropout: Dropout,
}

impl AttentionOutput {
    pub fn init(all_head_size: usize, hidden_size: usize, config: &ModelConfig) -> Self {
        Self {
            dense: Dense::init(all_head_size, hidden_size, config.initializer_range),
            layer_norm: LayerNorm::init(hidden_size, config.layer_norm_eps),
            dropout: Dropout::new(config.hidden_dropout_prob),
        }
    }

    pub fn forward(
        &self,
        context: &Array3<f32>,
        residual: &Array3<f32>,
        training: bool,
    ) -> Result<Array3<f32>> {
        let mut hidden = self.dense.forward_3d(context)?;
        self.dropout.forward_3d(&mut hidden, training);
        Ok(self.layer_norm.forward_3d(&(hidden + residual)))
    }
}

/// Variant dispatch over the three block layouts.
pub enum AttentionBlock {
    Uniform(UniformSelfAttention),
    Spectral(SpectralAttention),
    Hetero(HeteroAttention),
}

impl AttentionBlock {
    pub fn num_heads(&self) -> usize {
        match self {
            AttentionBlock::Uniform(b) => b.num_heads,
            AttentionBlock::Spectral(b) => b.num_heads,
            AttentionBlock::Hetero(b) => b.heads.len(),
        }
    }

    pub fn head_dim(&self) -> usize {
        match self {
            AttentionBlock::Uniform(b) => b.head_dim,
            AttentionBlock::Spectral(b) => b.head_dim,
            AttentionBlock::Hetero(b) => b.head_dim,
        }
    }

    pub fn all_head_size(&self) -> usize {
        self.num_heads() * self.head_dim()
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&Array1<f32>>,
        encoder_hidden_states: Option<&Array3<f32>>,
        past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
        output_attentions: bool,
        training: bool,
    ) -> Result<BlockOutput> {
        match self {
            AttentionBlock::Uniform(b) => b.forward(
                hidden_states,
                attention_mask,
                head_mask,
                encoder_hidden_states,
                past_kv,
                output_attentions,
                training,
            ),
            AttentionBlock::Spectral(b) => b.forward(
                hidden_states,
                attention_mask,
                head_mask,
                encoder_hidden_states,
                past_kv,
                output_attentions,
                training,
            ),
            AttentionBlock::Hetero(b) => b.forward(
                hidden_states,
                attention_mask,
                head_mask,
                encoder_hidden_states,
                past_kv,
                output_attentions,
                training,
            ),
        }
    }
}

/// Raw block output before the output projection.
pub struct BlockOutput {
    pub context: Array3<f32>, // [batch, seq, all_head_size]
    pub probs: Option<Array4<f32>>,
    pub new_kv: Option<(Array3<f32>, Array3<f32>)>,
}

/// One attention sub-block of an encoder layer: variant dispatch plus the
/// shared output projection.
pub struct Attention {
    pub block: AttentionBlock,
    pub output: AttentionOutput,
}

/// Result of a full attention sub-block forward pass.
pub struct AttentionOutputs {
    pub hidden_states: Array3<f32>, // [batch, seq, hidden]
    pub probs: Option<Array4<f32>>,
    pub new_kv: Option<(Array3<f32>, Array3<f32>)>,
}

impl Attention {
    /// Build the attention sub-block for layer `layer_idx` from the config.
    pub fn init(config: &ModelConfig, layer_idx: usize) -> Self {
        let hidden = config.hidden_dims[layer_idx];
        let all_head_size = config.all_head_size(layer_idx);
        let head_dim = config.head_dim(layer_idx);

        let relative = if config.position_embedding_type.is_relative() {
            Some(DistanceEmbedding::init(
                config.max_position_embeddings,
                head_dim,
                config.initializer_range,
                config.position_embedding_type,
            ))
        } else {
            None
        };

        let block = match &config.attention {
            AttentionLayout::Heterogeneous(layers) => AttentionBlock::Hetero(
                HeteroAttention::init(config, &layers[layer_idx], hidden, relative),
            ),
            AttentionLayout::Homogeneous(layers) => {
                let spec = layers[layer_idx];
                match spec.attention {
                    LayerAttention::SelfAttention(similarity) => {
                        AttentionBlock::Uniform(UniformSelfAttention::init(
                            config,
                            hidden,
                            spec.num_heads,
                            similarity == Similarity::Bilinear,
                            relative,
                        ))
                    }
                    LayerAttention::Spectral(transform) => {
                        AttentionBlock::Spectral(SpectralAttention::init(
                            config,
                            hidden,
                            spec.num_heads,
                            transform,
                            relative,
                        ))
                    }
                }
            }
        };

        let output = AttentionOutput::init(all_head_size, hidden, config);
        Self { block, output }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&Array1<f32>>,
        encoder_hidden_states: Option<&Array3<f32>>,
        past_kv: Option<(ArrayView3<f32>, ArrayView3<f32>)>,
        output_attentions: bool,
        training: bool,
    ) -> Result<AttentionOutputs> {
        let block_out = self.block.forward(
            hidden_states,
            attention_mask,
            head_mask,
            encoder_hidden_states,
            past_kv,
            output_attentions,
            training,
        )?;
        let hidden = self
            .output
            .forward(&block_out.context, hidden_states, training)?;
        Ok(AttentionOutputs {
            hidden_states: hidden,
            probs: block_out.probs,
            new_kv: block_out.new_kv,
        })
    }
}
