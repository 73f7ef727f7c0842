//! Feed-forward blocks with per-layer stage lists and optional inter-layer
//! width projection.

use anyhow::Result;
use ndarray::Array3;

use crate::activations::{Activation, apply_activation_3d};
use crate::config::ModelConfig;
use crate::dense::Dense;
use crate::dropout::Dropout;
use crate::normalization::LayerNorm;

/// One or more dense+activation stages widening the hidden representation.
pub struct Intermediate {
    pub stages: Vec<Dense>,
    pub activation: Activation,
}

impl Intermediate {
    pub fn init(config: &ModelConfig, layer_idx: usize) -> Self {
        let hidden = config.hidden_dims[layer_idx];
        let ff_dims = &config.ff_dims[layer_idx];

        let mut stages = Vec::with_capacity(ff_dims.len());
        stages.push(Dense::init(hidden, ff_dims[0], config.initializer_range));
        for pair in ff_dims.windows(2) {
            stages.push(Dense::init(pair[0], pair[1], config.initializer_range));
        }

        Self {
            stages,
            activation: config.hidden_act,
        }
    }

    pub fn forward(&self, hidden_states: &Array3<f32>) -> Result<Array3<f32>> {
        let mut out = hidden_states.clone();
        for stage in &self.stages {
            out = stage.forward_3d(&out)?;
            apply_activation_3d(&mut out, self.activation);
        }
        Ok(out)
    }
}

/// Closing half of a layer: project back to the hidden width, residual add,
/// layer norm, and (when the next layer is narrower or wider) a
/// dimension-matching projection.
pub struct FeedForwardOutput {
    pub dense: Dense,
    pub layer_norm: LayerNorm,
    pub dropout: Dropout,
    /// Present only when `hidden_dims[i] != hidden_dims[i + 1]`.
    pub projection: Option<Dense>,
}

impl FeedForwardOutput {
    pub fn init(config: &ModelConfig, layer_idx: usize, last_layer: bool) -> Self {
        let hidden = config.hidden_dims[layer_idx];
        let ff_last = *config.ff_dims[layer_idx].last().unwrap();

        let projection = if last_layer {
            None
        } else {
            let next_hidden = config.hidden_dims[layer_idx + 1];
            (hidden != next_hidden)
                .then(|| Dense::init(hidden, next_hidden, config.initializer_range))
        };

        Self {
            dense: Dense::init(ff_last, hidden, config.initializer_range),
            layer_norm: LayerNorm::init(hidden, config.layer_norm_eps),
            dropout: Dropout::new(config.hidden_dropout_prob),
            projection,
        }
    }

    pub fn forward(
        &self,
        hidden_states: &Array3<f32>,
        residual: &Array3<f32>,
        training: bool,
    ) -> Result<Array3<f32>> {
        let mut out = self.dense.forward_3d(hidden_states)?;
        self.dropout.forward_3d(&mut out, training);
        let mut out = self.layer_norm.forward_3d(&(out + residual));
        if let Some(projection) = &self.projection {
            out = projection.forward_3d(&out)?;
        }
        Ok(out)
    }
}
