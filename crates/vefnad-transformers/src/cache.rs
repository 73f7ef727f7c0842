//! Caller-owned key/value cache for cached (decoder) execution.
//!
//! The cache is an append-only buffer: each step writes its new K/V
//! projections after the current cursor and the cursor advances
//! monotonically. Per-layer widths follow the layer's `all_head_size`, which
//! may differ from layer to layer. Cross-attention K/V are computed once from
//! the encoder side and parked next to the self-attention buffers.

use anyhow::{Result, bail};
use ndarray::{Array3, ArrayView3, s};
use rayon::prelude::*;

use crate::config::ModelConfig;

struct LayerKV {
    self_k: Array3<f32>, // [batch, max_len, all_head_size]
    self_v: Array3<f32>,
    cross_k: Option<Array3<f32>>,
    cross_v: Option<Array3<f32>>,
}

/// Preallocated KV cache. Exclusively owned by the caller and threaded through
/// the encoder by mutable reference; layers never retain it.
pub struct KVCache {
    layers: Vec<LayerKV>,
    current_len: usize,
}

impl KVCache {
    pub fn new(config: &ModelConfig, batch_size: usize, max_len: usize) -> Self {
        let layers = (0..config.num_layers())
            .map(|i| {
                let width = config.all_head_size(i);
                LayerKV {
                    self_k: Array3::zeros((batch_size, max_len, width)),
                    self_v: Array3::zeros((batch_size, max_len, width)),
                    cross_k: None,
                    cross_v: None,
                }
            })
            .collect();
        Self {
            layers,
            current_len: 0,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn seq_len(&self) -> usize {
        self.current_len
    }

    pub fn max_len(&self) -> usize {
        self.layers
            .first()
            .map(|l| l.self_k.shape()[1])
            .unwrap_or(0)
    }

    pub fn batch_size(&self) -> usize {
        self.layers
            .first()
            .map(|l| l.self_k.shape()[0])
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.current_len = 0;
        for layer in &mut self.layers {
            layer.cross_k = None;
            layer.cross_v = None;
        }
    }

    /// Cached self-attention K/V of a layer, sliced to the live region.
    /// `None` while the cache is empty.
    pub fn self_kv(&self, layer_idx: usize) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        if self.current_len == 0 || layer_idx >= self.layers.len() {
            return None;
        }
        let layer = &self.layers[layer_idx];
        let live = s![.., 0..self.current_len, ..];
        Some((layer.self_k.slice(live), layer.self_v.slice(live)))
    }

    /// Append new K/V projections after the cursor. The cursor itself moves
    /// only in [`KVCache::increment_len`], once all layers have written.
    pub fn update_self(
        &mut self,
        layer_idx: usize,
        new_k: &Array3<f32>,
        new_v: &Array3<f32>,
    ) -> Result<()> {
        if layer_idx >= self.layers.len() {
            bail!(
                "layer index {} out of bounds (num_layers={})",
                layer_idx,
                self.layers.len()
            );
        }

        let new_tokens = new_k.shape()[1];
        let end = self.current_len + new_tokens;
        if end > self.max_len() {
            bail!(
                "cache overflow: current_len={}, new_tokens={}, max_len={}",
                self.current_len,
                new_tokens,
                self.max_len()
            );
        }

        let target = s![.., self.current_len..end, ..];
        let layer = &mut self.layers[layer_idx];
        layer.self_k.slice_mut(target).assign(new_k);
        layer.self_v.slice_mut(target).assign(new_v);
        Ok(())
    }

    pub fn increment_len(&mut self, new_tokens: usize) {
        self.current_len += new_tokens;
    }

    /// Cross-attention K/V of a layer, if already computed.
    pub fn cross_kv(
        &self,
        layer_idx: usize,
    ) -> Option<(ArrayView3<'_, f32>, ArrayView3<'_, f32>)> {
        let layer = self.layers.get(layer_idx)?;
        match (&layer.cross_k, &layer.cross_v) {
            (Some(k), Some(v)) => Some((k.view(), v.view())),
            _ => None,
        }
    }

    /// Park the once-computed encoder-side projections of a layer.
    pub fn set_cross(&mut self, layer_idx: usize, k: Array3<f32>, v: Array3<f32>) {
        if let Some(layer) = self.layers.get_mut(layer_idx) {
            layer.cross_k = Some(k);
            layer.cross_v = Some(v);
        }
    }

    /// Reorder the batch axis in place, e.g. after a beam-search step.
    pub fn reorder(&mut self, beam_indices: &[usize]) {
        let reordered = reorder_beams(self, beam_indices);
        self.layers = reordered.layers;
    }
}

/// Pure beam reordering: returns a new cache whose batch entry `i` is the
/// input's entry `beam_indices[i]`. The input is left untouched.
pub fn reorder_beams(cache: &KVCache, beam_indices: &[usize]) -> KVCache {
    let layers = cache
        .layers
        .par_iter()
        .map(|layer| LayerKV {
            self_k: select_batches(&layer.self_k, beam_indices),
            self_v: select_batches(&layer.self_v, beam_indices),
            cross_k: layer.cross_k.as_ref().map(|k| select_batches(k, beam_indices)),
            cross_v: layer.cross_v.as_ref().map(|v| select_batches(v, beam_indices)),
        })
        .collect();

    KVCache {
        layers,
        current_len: cache.current_len,
    }
}

fn select_batches(x: &Array3<f32>, indices: &[usize]) -> Array3<f32> {
    let (_, seq, width) = x.dim();
    let mut out = Array3::zeros((indices.len(), seq, width));
    for (dest, &src) in indices.iter().enumerate() {
        out.slice_mut(s![dest, .., ..]).assign(&x.slice(s![src, .., ..]));
    }
    out
}
