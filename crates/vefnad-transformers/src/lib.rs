//! Transformer encoder stacks with independently configurable per-layer shape
//! and per-head attention operators, plus cross-architecture weight transfer.
//!
//! Two subsystems carry the weight here: the heterogeneous multi-head
//! attention engine ([`attention`]), where each head slot of a layer can be a
//! different operator (dot-product, bilinear, fixed spectral transform, or
//! dynamic convolution), and the parameter transfer engine ([`transfer`]),
//! which transplants trained weights between models whose per-layer widths,
//! head counts, head types and feed-forward depths may all differ.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod config;
pub mod dense;
pub mod dropout;
pub mod embeddings;
pub mod encoder;
pub mod error;
pub mod feedforward;
pub mod model;
pub mod normalization;
pub mod ops;
pub mod pooler;
pub mod spectral;
pub mod transfer;

// Re-export commonly used items
pub use crate::{
    activations::Activation,
    attention::{Attention, AttentionBlock, HeteroAttention},
    cache::{KVCache, reorder_beams},
    config::{
        AttentionLayout, HeadKind, HeadSpec, LayerAttention, ModelConfig,
        PositionEmbeddingType, Similarity, SpectralTransform, UniformLayerSpec,
    },
    embeddings::Embeddings,
    encoder::{Encoder, EncoderLayer},
    error::{VefnadError, VefnadResult},
    model::{Model, ModelInputs, ModelOutput, build_model},
    normalization::LayerNorm,
    pooler::Pooler,
    transfer::{TransferMode, transfer_weights},
};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::KVCache;
    pub use crate::config::{AttentionLayout, HeadKind, HeadSpec, ModelConfig};
    pub use crate::error::{VefnadError, VefnadResult};
    pub use crate::model::{Model, ModelInputs, build_model};
    pub use crate::transfer::{TransferMode, transfer_weights};
}
