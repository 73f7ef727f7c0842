//! Model assembly: embeddings, encoder stack and pooler, plus the flat
//! parameter-path export used as the join-key space during weight transfer.

use anyhow::{Result, bail};
use log::debug;
use ndarray::{Array1, Array2, Array3, Array4, ArrayViewD};

use crate::attention::{Attention, AttentionBlock, HeadOp};
use crate::cache::KVCache;
use crate::config::ModelConfig;
use crate::embeddings::Embeddings;
use crate::encoder::{Encoder, EncoderOutput};
use crate::error::VefnadResult;
use crate::ops::masks::{extend_attention_mask, extend_causal_attention_mask, invert_encoder_mask};
use crate::pooler::Pooler;

/// A layer stack bound to one config. Constructed once with random
/// initialization; the transfer engine may then rewrite its parameters in
/// place before it is used read-only for inference or training.
pub struct Model {
    pub config: ModelConfig,
    pub embeddings: Embeddings,
    pub encoder: Encoder,
    pub pooler: Option<Pooler>,
}

/// Inputs of one forward call. Everything except the hidden input is optional.
#[derive(Default)]
pub struct ModelInputs<'a> {
    pub input_ids: Option<&'a Array2<usize>>,
    pub inputs_embeds: Option<&'a Array3<f32>>,
    /// `[batch, key_len]`, 1.0 = attend, 0.0 = padding. Covers cached
    /// positions when a cache is threaded through.
    pub attention_mask: Option<&'a Array2<f32>>,
    pub token_type_ids: Option<&'a Array2<usize>>,
    /// Per-layer head masks; `None` entries leave a layer unmasked.
    pub head_mask: Option<&'a [Option<Array1<f32>>]>,
    pub encoder_hidden_states: Option<&'a Array3<f32>>,
    pub encoder_attention_mask: Option<&'a Array2<f32>>,
    pub cache: Option<&'a mut KVCache>,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
    pub training: bool,
}

/// Outputs of one forward call.
pub struct ModelOutput {
    pub last_hidden_state: Array3<f32>,
    pub pooler_output: Option<Array2<f32>>,
    pub hidden_states: Option<Vec<Array3<f32>>>,
    pub attentions: Option<Vec<Array4<f32>>>,
    pub cross_attentions: Option<Vec<Array4<f32>>>,
}

/// Validate the config and build a randomly initialized model with a pooler.
pub fn build_model(config: &ModelConfig) -> VefnadResult<Model> {
    Model::init(config, true)
}

impl Model {
    pub fn init(config: &ModelConfig, add_pooling_layer: bool) -> VefnadResult<Self> {
        config.validate()?;
        debug!(
            "building model: {} layers, heterogeneous={}",
            config.num_layers(),
            config.attention.is_heterogeneous()
        );
        Ok(Self {
            config: config.clone(),
            embeddings: Embeddings::init(config),
            encoder: Encoder::init(config),
            pooler: add_pooling_layer.then(|| Pooler::init(config)),
        })
    }

    pub fn forward(&self, inputs: ModelInputs) -> Result<ModelOutput> {
        let ModelInputs {
            input_ids,
            inputs_embeds,
            attention_mask,
            token_type_ids,
            head_mask,
            encoder_hidden_states,
            encoder_attention_mask,
            cache,
            output_attentions,
            output_hidden_states,
            training,
        } = inputs;

        let past_len = cache.as_ref().map_or(0, |c| c.seq_len());

        let (batch, seq_len, embedded) = match (input_ids, inputs_embeds) {
            (Some(_), Some(_)) => {
                bail!("cannot specify both input_ids and inputs_embeds")
            }
            (Some(ids), None) => {
                let (batch, seq_len) = ids.dim();
                let embedded =
                    self.embeddings
                        .forward(ids, token_type_ids, past_len, training)?;
                (batch, seq_len, embedded)
            }
            (None, Some(embeds)) => {
                let (batch, seq_len, _) = embeds.dim();
                let embedded = self.embeddings.forward_embeds(
                    embeds,
                    token_type_ids,
                    past_len,
                    training,
                )?;
                (batch, seq_len, embedded)
            }
            (None, None) => bail!("either input_ids or inputs_embeds is required"),
        };

        let key_len = past_len + seq_len;
        let owned_mask;
        let mask_2d = match attention_mask {
            Some(mask) => {
                if mask.dim() != (batch, key_len) {
                    bail!(
                        "attention mask shape {:?} does not match [batch={}, key_len={}]",
                        mask.dim(),
                        batch,
                        key_len
                    );
                }
                mask
            }
            None => {
                owned_mask = Array2::<f32>::ones((batch, key_len));
                &owned_mask
            }
        };

        let extended_mask = if self.config.is_decoder {
            extend_causal_attention_mask(mask_2d, seq_len, past_len)
        } else {
            extend_attention_mask(mask_2d)
        };

        let owned_encoder_mask;
        let extended_encoder_mask = match (encoder_hidden_states, encoder_attention_mask) {
            (Some(_), Some(mask)) => {
                owned_encoder_mask = invert_encoder_mask(mask);
                Some(&owned_encoder_mask)
            }
            (Some(states), None) => {
                let ones = Array2::<f32>::ones((batch, states.shape()[1]));
                owned_encoder_mask = invert_encoder_mask(&ones);
                Some(&owned_encoder_mask)
            }
            (None, _) => None,
        };

        let encoder_out: EncoderOutput = self.encoder.forward(
            embedded,
            Some(&extended_mask),
            head_mask,
            encoder_hidden_states,
            extended_encoder_mask,
            cache,
            output_attentions,
            output_hidden_states,
            training,
        )?;

        let pooler_output = match &self.pooler {
            Some(pooler) => Some(pooler.forward(&encoder_out.last_hidden_state)?),
            None => None,
        };

        Ok(ModelOutput {
            last_hidden_state: encoder_out.last_hidden_state,
            pooler_output,
            hidden_states: encoder_out.hidden_states,
            attentions: encoder_out.attentions,
            cross_attentions: encoder_out.cross_attentions,
        })
    }

    /// Walk every parameter tensor as a flat `path -> tensor` mapping.
    ///
    /// Paths are hierarchical (`encoder.layer.3.attention.self.query.weight`)
    /// and serve as the join-key space for external tooling; the transfer
    /// engine itself walks the typed tree.
    pub fn visit_parameters(&self, f: &mut dyn FnMut(String, ArrayViewD<'_, f32>)) {
        f(
            "embeddings.word_embeddings.weight".into(),
            self.embeddings.word_embeddings.view().into_dyn(),
        );
        f(
            "embeddings.position_embeddings.weight".into(),
            self.embeddings.position_embeddings.view().into_dyn(),
        );
        f(
            "embeddings.token_type_embeddings.weight".into(),
            self.embeddings.token_type_embeddings.view().into_dyn(),
        );
        f(
            "embeddings.layer_norm.weight".into(),
            self.embeddings.layer_norm.weight.view().into_dyn(),
        );
        f(
            "embeddings.layer_norm.bias".into(),
            self.embeddings.layer_norm.bias.view().into_dyn(),
        );

        for (i, layer) in self.encoder.layers.iter().enumerate() {
            let prefix = format!("encoder.layer.{}", i);
            visit_attention(&format!("{}.attention", prefix), &layer.attention, f);
            if let Some(cross) = &layer.cross_attention {
                visit_attention(&format!("{}.cross_attention", prefix), cross, f);
            }
            for (s, stage) in layer.intermediate.stages.iter().enumerate() {
                visit_dense(&format!("{}.intermediate.{}", prefix, s), stage, f);
            }
            visit_dense(&format!("{}.output.dense", prefix), &layer.output.dense, f);
            f(
                format!("{}.output.layer_norm.weight", prefix),
                layer.output.layer_norm.weight.view().into_dyn(),
            );
            f(
                format!("{}.output.layer_norm.bias", prefix),
                layer.output.layer_norm.bias.view().into_dyn(),
            );
            if let Some(projection) = &layer.output.projection {
                visit_dense(&format!("{}.output.projection", prefix), projection, f);
            }
        }

        if let Some(pooler) = &self.pooler {
            visit_dense("pooler.dense", &pooler.dense, f);
        }
    }

    /// Flat export of all parameter paths and shapes.
    pub fn named_parameters(&self) -> Vec<(String, Vec<usize>)> {
        let mut out = Vec::new();
        self.visit_parameters(&mut |name, view| {
            out.push((name, view.shape().to_vec()));
        });
        out
    }

    /// Total number of parameter values.
    pub fn num_parameters(&self) -> usize {
        let mut total = 0;
        self.visit_parameters(&mut |_, view| total += view.len());
        total
    }
}

fn visit_dense(
    prefix: &str,
    dense: &crate::dense::Dense,
    f: &mut dyn FnMut(String, ArrayViewD<'_, f32>),
) {
    f(format!("{}.weight", prefix), dense.weight.view().into_dyn());
    if let Some(bias) = &dense.bias {
        f(format!("{}.bias", prefix), bias.view().into_dyn());
    }
}

fn visit_attention(
    prefix: &str,
    attention: &Attention,
    f: &mut dyn FnMut(String, ArrayViewD<'_, f32>),
) {
    let self_prefix = format!("{}.self", prefix);
    match &attention.block {
        AttentionBlock::Uniform(block) => {
            visit_dense(&format!("{}.query", self_prefix), &block.query, f);
            visit_dense(&format!("{}.key", self_prefix), &block.key, f);
            visit_dense(&format!("{}.value", self_prefix), &block.value, f);
            if let Some(w) = &block.w {
                f(format!("{}.w", self_prefix), w.view().into_dyn());
            }
            if let Some(rel) = &block.relative {
                f(
                    format!("{}.distance_embedding.weight", self_prefix),
                    rel.table.view().into_dyn(),
                );
            }
        }
        AttentionBlock::Spectral(block) => {
            visit_dense(&format!("{}.query", self_prefix), &block.query, f);
            visit_dense(&format!("{}.key", self_prefix), &block.key, f);
            visit_dense(&format!("{}.value", self_prefix), &block.value, f);
            if let Some(rel) = &block.relative {
                f(
                    format!("{}.distance_embedding.weight", self_prefix),
                    rel.table.view().into_dyn(),
                );
            }
        }
        AttentionBlock::Hetero(block) => {
            visit_dense(&format!("{}.query", self_prefix), &block.query, f);
            visit_dense(&format!("{}.key", self_prefix), &block.key, f);
            visit_dense(&format!("{}.value", self_prefix), &block.value, f);
            if let Some(rel) = &block.relative {
                f(
                    format!("{}.distance_embedding.weight", self_prefix),
                    rel.table.view().into_dyn(),
                );
            }
            for (j, head) in block.heads.iter().enumerate() {
                let head_prefix = format!("{}.heads.{}", self_prefix, j);
                match head {
                    HeadOp::DotProduct | HeadOp::Spectral(_) => {}
                    HeadOp::Bilinear { w } => {
                        f(format!("{}.w", head_prefix), w.view().into_dyn());
                    }
                    HeadOp::Conv(conv) => {
                        f(
                            format!("{}.key_conv.depthwise", head_prefix),
                            conv.key_conv.depthwise.view().into_dyn(),
                        );
                        f(
                            format!("{}.key_conv.pointwise", head_prefix),
                            conv.key_conv.pointwise.view().into_dyn(),
                        );
                        f(
                            format!("{}.key_conv.bias", head_prefix),
                            conv.key_conv.bias.view().into_dyn(),
                        );
                        visit_dense(&format!("{}.conv_kernel", head_prefix), &conv.kernel_dense, f);
                        visit_dense(&format!("{}.conv_out", head_prefix), &conv.out_dense, f);
                    }
                }
            }
        }
    }

    visit_dense(&format!("{}.output.dense", prefix), &attention.output.dense, f);
    f(
        format!("{}.output.layer_norm.weight", prefix),
        attention.output.layer_norm.weight.view().into_dyn(),
    );
    f(
        format!("{}.output.layer_norm.bias", prefix),
        attention.output.layer_norm.bias.view().into_dyn(),
    );
}
