//! Additive attention mask construction.
//!
//! Masks arrive as `[batch, key_len]` tensors with 1.0 for tokens that may be
//! attended to and 0.0 for padding. They are expanded here into additive bias
//! tensors broadcastable over `[batch, heads, query_len, key_len]` scores, with
//! masked positions pushed to `MASK_VALUE` before the softmax.

use ndarray::{Array2, Array4};

pub const MASK_VALUE: f32 = -1e9;

/// Expand a padding mask to `[batch, 1, 1, key_len]` additive form.
pub fn extend_attention_mask(mask: &Array2<f32>) -> Array4<f32> {
    let (batch, key_len) = mask.dim();
    Array4::from_shape_fn((batch, 1, 1, key_len), |(b, _, _, k)| {
        if mask[[b, k]] == 0.0 { MASK_VALUE } else { 0.0 }
    })
}

/// Expand a padding mask to `[batch, 1, query_len, key_len]` additive form with
/// a causal constraint for decoder self-attention.
///
/// Query position `q` attends to key positions `0..=past_len + q`; the padding
/// mask covers the full key length (cached positions included).
pub fn extend_causal_attention_mask(
    mask: &Array2<f32>,
    query_len: usize,
    past_len: usize,
) -> Array4<f32> {
    let (batch, key_len) = mask.dim();
    Array4::from_shape_fn((batch, 1, query_len, key_len), |(b, _, q, k)| {
        if mask[[b, k]] == 0.0 || k > past_len + q {
            MASK_VALUE
        } else {
            0.0
        }
    })
}

/// Invert an encoder padding mask into the additive form used by
/// cross-attention.
pub fn invert_encoder_mask(mask: &Array2<f32>) -> Array4<f32> {
    extend_attention_mask(mask)
}
