//! Model configuration with per-layer shape lists.
//!
//! Every structural degree of freedom is a per-layer list: hidden width,
//! feed-forward stage widths, and the attention layout (either one uniform
//! operator per layer, or an ordered list of per-head descriptors). Validation
//! runs before any tensor is allocated.

use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::error::{VefnadError, VefnadResult};

/// Similarity operator for self-attention heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Similarity {
    /// Scaled dot-product: `q · kᵀ`.
    #[serde(rename = "sdp")]
    DotProduct,
    /// Weighted multiplicative attention: `(q · W) · kᵀ` with a learned `W`.
    #[serde(rename = "wma")]
    Bilinear,
}

/// Fixed orthogonal transform for linear-transform heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectralTransform {
    #[serde(rename = "dft")]
    Fourier,
    #[serde(rename = "dct")]
    Cosine,
}

/// Attention operator of a single head slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadKind {
    SelfAttention(Similarity),
    Spectral(SpectralTransform),
    Conv { kernel_size: usize },
}

impl HeadKind {
    /// Coarse type tag used for head-to-head transfer compatibility.
    /// Heads are only transferred between slots whose tags agree.
    pub fn type_tag(&self) -> &'static str {
        match self {
            HeadKind::SelfAttention(_) => "sa",
            HeadKind::Spectral(_) => "l",
            HeadKind::Conv { .. } => "c",
        }
    }
}

/// One head slot: operator plus its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub kind: HeadKind,
    pub head_dim: usize,
}

/// Layer-wide attention operator in homogeneous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerAttention {
    SelfAttention(Similarity),
    Spectral(SpectralTransform),
}

impl LayerAttention {
    pub fn type_tag(&self) -> &'static str {
        match self {
            LayerAttention::SelfAttention(_) => "sa",
            LayerAttention::Spectral(_) => "l",
        }
    }
}

/// Homogeneous per-layer attention description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniformLayerSpec {
    pub num_heads: usize,
    pub attention: LayerAttention,
}

/// Per-layer attention layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionLayout {
    /// Every head in a layer may be a different operator.
    Heterogeneous(Vec<Vec<HeadSpec>>),
    /// One operator per layer, classic multi-head split.
    Homogeneous(Vec<UniformLayerSpec>),
}

impl AttentionLayout {
    pub fn num_layers(&self) -> usize {
        match self {
            AttentionLayout::Heterogeneous(layers) => layers.len(),
            AttentionLayout::Homogeneous(layers) => layers.len(),
        }
    }

    pub fn is_heterogeneous(&self) -> bool {
        matches!(self, AttentionLayout::Heterogeneous(_))
    }
}

/// Position embedding flavor; relative modes add a learned bias indexed by
/// pairwise distance before the softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    Absolute,
    RelativeKey,
    RelativeKeyQuery,
}

impl PositionEmbeddingType {
    pub fn is_relative(&self) -> bool {
        !matches!(self, PositionEmbeddingType::Absolute)
    }
}

/// Full model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub type_vocab_size: usize,
    pub pad_token_id: usize,
    pub max_position_embeddings: usize,
    pub position_embedding_type: PositionEmbeddingType,
    /// Hidden width of each layer.
    pub hidden_dims: Vec<usize>,
    /// Feed-forward stage widths of each layer (one or more stages).
    pub ff_dims: Vec<Vec<usize>>,
    pub attention: AttentionLayout,
    pub hidden_act: Activation,
    pub layer_norm_eps: f32,
    pub hidden_dropout_prob: f32,
    pub attention_probs_dropout_prob: f32,
    pub initializer_range: f32,
    /// Sequence-axis chunk size for the feed-forward pass; 0 disables chunking.
    pub chunk_size_feed_forward: usize,
    pub is_decoder: bool,
    pub add_cross_attention: bool,
    /// Waives the hidden/head divisibility check in homogeneous mode.
    pub embedding_size: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let num_layers = 12;
        Self {
            vocab_size: 30_522,
            type_vocab_size: 2,
            pad_token_id: 0,
            max_position_embeddings: 512,
            position_embedding_type: PositionEmbeddingType::Absolute,
            hidden_dims: vec![768; num_layers],
            ff_dims: vec![vec![3072]; num_layers],
            attention: AttentionLayout::Homogeneous(vec![
                UniformLayerSpec {
                    num_heads: 12,
                    attention: LayerAttention::SelfAttention(Similarity::DotProduct),
                };
                num_layers
            ]),
            hidden_act: Activation::Gelu,
            layer_norm_eps: 1e-12,
            hidden_dropout_prob: 0.1,
            attention_probs_dropout_prob: 0.1,
            initializer_range: 0.02,
            chunk_size_feed_forward: 0,
            is_decoder: false,
            add_cross_attention: false,
            embedding_size: None,
        }
    }
}

impl ModelConfig {
    pub fn num_layers(&self) -> usize {
        self.hidden_dims.len()
    }

    /// Number of head slots in layer `i`.
    pub fn num_heads(&self, i: usize) -> usize {
        match &self.attention {
            AttentionLayout::Heterogeneous(layers) => layers[i].len(),
            AttentionLayout::Homogeneous(layers) => layers[i].num_heads,
        }
    }

    /// Per-head width of layer `i`.
    pub fn head_dim(&self, i: usize) -> usize {
        match &self.attention {
            AttentionLayout::Heterogeneous(layers) => layers[i][0].head_dim,
            AttentionLayout::Homogeneous(layers) => {
                self.hidden_dims[i] / layers[i].num_heads
            }
        }
    }

    /// Concatenated width of all heads in layer `i`. In heterogeneous mode this
    /// need not equal the hidden width; the output projection reconciles them.
    pub fn all_head_size(&self, i: usize) -> usize {
        self.num_heads(i) * self.head_dim(i)
    }

    /// Head descriptors of layer `i` (heterogeneous mode only).
    pub fn head_specs(&self, i: usize) -> Option<&[HeadSpec]> {
        match &self.attention {
            AttentionLayout::Heterogeneous(layers) => Some(&layers[i]),
            AttentionLayout::Homogeneous(_) => None,
        }
    }

    /// Validate all shape invariants. Called by `build_model` before any
    /// tensor allocation.
    pub fn validate(&self) -> VefnadResult<()> {
        let n = self.num_layers();
        if n == 0 {
            return Err(VefnadError::InvalidConfig(
                "model must have at least one layer".into(),
            ));
        }
        if self.ff_dims.len() != n || self.attention.num_layers() != n {
            return Err(VefnadError::InvalidConfig(format!(
                "per-layer lists disagree on depth: {} hidden, {} feed-forward, {} attention",
                n,
                self.ff_dims.len(),
                self.attention.num_layers()
            )));
        }
        if self.vocab_size == 0 || self.max_position_embeddings == 0 {
            return Err(VefnadError::InvalidConfig(
                "vocab size and max position embeddings must be positive".into(),
            ));
        }
        for (i, stages) in self.ff_dims.iter().enumerate() {
            if stages.is_empty() || stages.contains(&0) {
                return Err(VefnadError::InvalidConfig(format!(
                    "layer {} needs at least one non-zero feed-forward stage",
                    i
                )));
            }
        }
        for prob in [self.hidden_dropout_prob, self.attention_probs_dropout_prob] {
            if !(0.0..1.0).contains(&prob) {
                return Err(VefnadError::InvalidConfig(format!(
                    "dropout probability {} outside [0, 1)",
                    prob
                )));
            }
        }
        if self.add_cross_attention && !self.is_decoder {
            return Err(VefnadError::InvalidConfig(
                "cross-attention requires decoder mode".into(),
            ));
        }

        match &self.attention {
            AttentionLayout::Heterogeneous(layers) => {
                for (i, heads) in layers.iter().enumerate() {
                    if heads.is_empty() {
                        return Err(VefnadError::InvalidConfig(format!(
                            "layer {} has no attention heads",
                            i
                        )));
                    }
                    let head_dim = heads[0].head_dim;
                    if head_dim == 0 {
                        return Err(VefnadError::InvalidConfig(format!(
                            "layer {} has zero-width heads",
                            i
                        )));
                    }
                    if heads.iter().any(|h| h.head_dim != head_dim) {
                        return Err(VefnadError::InvalidConfig(format!(
                            "all attention heads in layer {} must share one head_dim",
                            i
                        )));
                    }
                    for head in heads {
                        if let HeadKind::Conv { kernel_size } = head.kind {
                            if kernel_size == 0 || kernel_size % 2 == 0 {
                                return Err(VefnadError::InvalidConfig(format!(
                                    "layer {} conv head kernel size {} must be odd",
                                    i, kernel_size
                                )));
                            }
                        }
                    }
                }
            }
            AttentionLayout::Homogeneous(layers) => {
                for (i, spec) in layers.iter().enumerate() {
                    if spec.num_heads == 0 {
                        return Err(VefnadError::InvalidConfig(format!(
                            "layer {} has no attention heads",
                            i
                        )));
                    }
                    if self.hidden_dims[i] % spec.num_heads != 0
                        && self.embedding_size.is_none()
                    {
                        return Err(VefnadError::InvalidConfig(format!(
                            "hidden size {} of layer {} is not a multiple of the number \
                             of attention heads {}",
                            self.hidden_dims[i], i, spec.num_heads
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hetero_config(heads: Vec<Vec<HeadSpec>>) -> ModelConfig {
        let n = heads.len();
        ModelConfig {
            hidden_dims: vec![64; n],
            ff_dims: vec![vec![128]; n],
            attention: AttentionLayout::Heterogeneous(heads),
            vocab_size: 100,
            max_position_embeddings: 32,
            ..ModelConfig::default()
        }
    }

    fn head(kind: HeadKind, head_dim: usize) -> HeadSpec {
        HeadSpec { kind, head_dim }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_uniform_head_dim_required() {
        let config = hetero_config(vec![vec![
            head(HeadKind::SelfAttention(Similarity::DotProduct), 16),
            head(HeadKind::SelfAttention(Similarity::Bilinear), 32),
        ]]);
        assert!(matches!(
            config.validate(),
            Err(VefnadError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut config = ModelConfig::default();
        config.attention = AttentionLayout::Homogeneous(vec![
            UniformLayerSpec {
                num_heads: 7,
                attention: LayerAttention::SelfAttention(Similarity::DotProduct),
            };
            12
        ]);
        assert!(config.validate().is_err());

        // The explicit embedding-size override waives the check.
        config.embedding_size = Some(768);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_even_conv_kernel_rejected() {
        let config = hetero_config(vec![vec![
            head(HeadKind::Conv { kernel_size: 4 }, 16),
            head(HeadKind::SelfAttention(Similarity::DotProduct), 16),
        ]]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cross_attention_requires_decoder() {
        let mut config = ModelConfig::default();
        config.add_cross_attention = true;
        assert!(config.validate().is_err());
        config.is_decoder = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_all_head_size_independent_of_hidden() {
        let config = hetero_config(vec![vec![
            head(HeadKind::SelfAttention(Similarity::DotProduct), 32),
            head(HeadKind::Spectral(SpectralTransform::Cosine), 32),
            head(HeadKind::Conv { kernel_size: 3 }, 32),
        ]]);
        assert!(config.validate().is_ok());
        assert_eq!(config.all_head_size(0), 96);
        assert_eq!(config.hidden_dims[0], 64);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = hetero_config(vec![vec![
            head(HeadKind::SelfAttention(Similarity::Bilinear), 16),
            head(HeadKind::Spectral(SpectralTransform::Fourier), 16),
            head(HeadKind::Conv { kernel_size: 5 }, 16),
        ]]);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ModelConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.attention, config.attention);
        assert_eq!(parsed.hidden_dims, config.hidden_dims);
    }

    #[test]
    fn test_head_type_tags() {
        assert_eq!(
            HeadKind::SelfAttention(Similarity::DotProduct).type_tag(),
            "sa"
        );
        assert_eq!(HeadKind::Spectral(SpectralTransform::Fourier).type_tag(), "l");
        assert_eq!(HeadKind::Conv { kernel_size: 3 }.type_tag(), "c");
    }
}
