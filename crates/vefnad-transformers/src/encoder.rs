//! Encoder layer and layer stack.

use anyhow::{Result, bail};
use ndarray::{Array1, Array3, Array4, Axis};

use crate::attention::Attention;
use crate::cache::KVCache;
use crate::config::ModelConfig;
use crate::feedforward::{FeedForwardOutput, Intermediate};

/// One encoder layer: self-attention, optional cross-attention, feed-forward.
pub struct EncoderLayer {
    pub attention: Attention,
    pub cross_attention: Option<Attention>,
    pub intermediate: Intermediate,
    pub output: FeedForwardOutput,
    chunk_size_feed_forward: usize,
}

/// Per-layer forward results handed back to the stack walk.
pub struct LayerOutput {
    pub hidden_states: Array3<f32>,
    pub self_probs: Option<Array4<f32>>,
    pub cross_probs: Option<Array4<f32>>,
    pub new_self_kv: Option<(Array3<f32>, Array3<f32>)>,
    pub new_cross_kv: Option<(Array3<f32>, Array3<f32>)>,
}

impl EncoderLayer {
    pub fn init(config: &ModelConfig, layer_idx: usize, last_layer: bool) -> Self {
        let cross_attention = config
            .add_cross_attention
            .then(|| Attention::init(config, layer_idx));
        Self {
            attention: Attention::init(config, layer_idx),
            cross_attention,
            intermediate: Intermediate::init(config, layer_idx),
            output: FeedForwardOutput::init(config, layer_idx, last_layer),
            chunk_size_feed_forward: config.chunk_size_feed_forward,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&Array1<f32>>,
        encoder_hidden_states: Option<&Array3<f32>>,
        encoder_attention_mask: Option<&Array4<f32>>,
        past_self_kv: Option<(ndarray::ArrayView3<f32>, ndarray::ArrayView3<f32>)>,
        past_cross_kv: Option<(ndarray::ArrayView3<f32>, ndarray::ArrayView3<f32>)>,
        output_attentions: bool,
        training: bool,
    ) -> Result<LayerOutput> {
        let self_out = self.attention.forward(
            hidden_states,
            attention_mask,
            head_mask,
            None,
            past_self_kv,
            output_attentions,
            training,
        )?;
        let mut attention_output = self_out.hidden_states;

        let mut cross_probs = None;
        let mut new_cross_kv = None;
        if let Some(encoder_states) = encoder_hidden_states {
            let Some(cross) = &self.cross_attention else {
                bail!(
                    "encoder hidden states passed to a layer built without \
                     cross-attention"
                );
            };
            let cross_out = cross.forward(
                &attention_output,
                encoder_attention_mask,
                head_mask,
                Some(encoder_states),
                past_cross_kv,
                output_attentions,
                training,
            )?;
            attention_output = cross_out.hidden_states;
            cross_probs = cross_out.probs;
            new_cross_kv = cross_out.new_kv;
        }

        let hidden = self.feed_forward(&attention_output, training)?;

        Ok(LayerOutput {
            hidden_states: hidden,
            self_probs: self_out.probs,
            cross_probs,
            new_self_kv: self_out.new_kv,
            new_cross_kv,
        })
    }

    /// Feed-forward pass, optionally chunked along the sequence axis for
    /// memory-bounded execution. Chunking never changes the result; every
    /// position is processed independently.
    fn feed_forward(&self, attention_output: &Array3<f32>, training: bool) -> Result<Array3<f32>> {
        let seq_len = attention_output.shape()[1];
        let chunk = self.chunk_size_feed_forward;

        if chunk == 0 || chunk >= seq_len {
            let intermediate = self.intermediate.forward(attention_output)?;
            return self.output.forward(&intermediate, attention_output, training);
        }

        let mut chunks = Vec::with_capacity(seq_len.div_ceil(chunk));
        let mut start = 0;
        while start < seq_len {
            let end = (start + chunk).min(seq_len);
            let slab = attention_output
                .slice_axis(Axis(1), ndarray::Slice::from(start..end))
                .to_owned();
            let intermediate = self.intermediate.forward(&slab)?;
            chunks.push(self.output.forward(&intermediate, &slab, training)?);
            start = end;
        }

        let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
        Ok(ndarray::concatenate(Axis(1), &views)?)
    }
}

/// The full layer stack.
pub struct Encoder {
    pub layers: Vec<EncoderLayer>,
}

/// Aggregated outputs of a stack walk.
pub struct EncoderOutput {
    pub last_hidden_state: Array3<f32>,
    pub hidden_states: Option<Vec<Array3<f32>>>,
    pub attentions: Option<Vec<Array4<f32>>>,
    pub cross_attentions: Option<Vec<Array4<f32>>>,
}

impl Encoder {
    pub fn init(config: &ModelConfig) -> Self {
        let num_layers = config.num_layers();
        let layers = (0..num_layers)
            .map(|i| EncoderLayer::init(config, i, i == num_layers - 1))
            .collect();
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        hidden_states: Array3<f32>,
        attention_mask: Option<&Array4<f32>>,
        head_mask: Option<&[Option<Array1<f32>>]>,
        encoder_hidden_states: Option<&Array3<f32>>,
        encoder_attention_mask: Option<&Array4<f32>>,
        mut cache: Option<&mut KVCache>,
        output_attentions: bool,
        output_hidden_states: bool,
        training: bool,
    ) -> Result<EncoderOutput> {
        if let Some(masks) = head_mask {
            if masks.len() != self.layers.len() {
                bail!(
                    "head mask covers {} layers, model has {}",
                    masks.len(),
                    self.layers.len()
                );
            }
        }
        if let Some(c) = &cache {
            if c.num_layers() != self.layers.len() {
                bail!(
                    "cache has {} layers, model has {}",
                    c.num_layers(),
                    self.layers.len()
                );
            }
        }

        let seq_len = hidden_states.shape()[1];
        let mut all_hidden = output_hidden_states.then(Vec::new);
        let mut all_attentions = output_attentions.then(Vec::new);
        let mut all_cross = (output_attentions && encoder_hidden_states.is_some())
            .then(Vec::new);

        let mut hidden = hidden_states;
        for (i, layer) in self.layers.iter().enumerate() {
            if let Some(collected) = &mut all_hidden {
                collected.push(hidden.clone());
            }

            let layer_head_mask = head_mask.and_then(|m| m[i].as_ref());
            let (past_self, past_cross) = match &cache {
                Some(c) => (c.self_kv(i), c.cross_kv(i)),
                None => (None, None),
            };
            // Views borrow from the cache; clone them out so the layer call
            // does not hold the borrow while we write back below.
            let past_self = past_self.map(|(k, v)| (k.to_owned(), v.to_owned()));
            let past_cross = past_cross.map(|(k, v)| (k.to_owned(), v.to_owned()));

            let out = layer.forward(
                &hidden,
                attention_mask,
                layer_head_mask,
                encoder_hidden_states,
                encoder_attention_mask,
                past_self.as_ref().map(|(k, v)| (k.view(), v.view())),
                past_cross.as_ref().map(|(k, v)| (k.view(), v.view())),
                output_attentions,
                training,
            )?;

            if let Some(c) = &mut cache {
                if let Some((new_k, new_v)) = &out.new_self_kv {
                    c.update_self(i, new_k, new_v)?;
                }
                if c.cross_kv(i).is_none() {
                    if let Some((k, v)) = out.new_cross_kv {
                        c.set_cross(i, k, v);
                    }
                }
            }

            hidden = out.hidden_states;
            if let Some(collected) = &mut all_attentions {
                if let Some(probs) = out.self_probs {
                    collected.push(probs);
                }
            }
            if let Some(collected) = &mut all_cross {
                if let Some(probs) = out.cross_probs {
                    collected.push(probs);
                }
            }
        }

        if let Some(c) = &mut cache {
            c.increment_len(seq_len);
        }
        if let Some(collected) = &mut all_hidden {
            collected.push(hidden.clone());
        }

        Ok(EncoderOutput {
            last_hidden_state: hidden,
            hidden_states: all_hidden,
            attentions: all_attentions,
            cross_attentions: all_cross,
        })
    }
}
