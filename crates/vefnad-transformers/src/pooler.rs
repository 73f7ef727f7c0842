//! First-token pooler.

use anyhow::Result;
use ndarray::{Array2, Array3, s};

use crate::activations::tanh_scalar;
use crate::config::ModelConfig;
use crate::dense::Dense;

/// Pools a sequence by projecting the first token through a tanh dense layer.
pub struct Pooler {
    pub dense: Dense,
}

impl Pooler {
    pub fn init(config: &ModelConfig) -> Self {
        let hidden = *config.hidden_dims.last().unwrap();
        Self {
            dense: Dense::init(hidden, hidden, config.initializer_range),
        }
    }

    pub fn forward(&self, hidden_states: &Array3<f32>) -> Result<Array2<f32>> {
        let first_token = hidden_states.slice(s![.., 0, ..]).to_owned();
        let mut pooled = self.dense.forward_2d(&first_token.view());
        pooled.mapv_inplace(tanh_scalar);
        Ok(pooled)
    }
}
