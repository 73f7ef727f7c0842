use std::collections::BTreeMap;
use std::str::FromStr;

use ndarray::s;

use crate::attention::{AttentionBlock, HeadOp};
use crate::config::{
    AttentionLayout, HeadKind, HeadSpec, LayerAttention, ModelConfig, PositionEmbeddingType,
    Similarity, SpectralTransform, UniformLayerSpec,
};
use crate::error::VefnadError;
use crate::model::{Model, build_model};
use crate::transfer::{TransferMode, transfer_weights};

fn head(kind: HeadKind, head_dim: usize) -> HeadSpec {
    HeadSpec { kind, head_dim }
}

fn hetero_config(heads: Vec<Vec<HeadSpec>>, hidden: Vec<usize>) -> ModelConfig {
    let n = heads.len();
    ModelConfig {
        vocab_size: 40,
        type_vocab_size: 2,
        max_position_embeddings: 16,
        position_embedding_type: PositionEmbeddingType::RelativeKey,
        hidden_dims: hidden,
        ff_dims: vec![vec![24]; n],
        attention: AttentionLayout::Heterogeneous(heads),
        ..ModelConfig::default()
    }
}

fn mixed_heads(head_dim: usize) -> Vec<HeadSpec> {
    vec![
        head(HeadKind::SelfAttention(Similarity::DotProduct), head_dim),
        head(HeadKind::SelfAttention(Similarity::Bilinear), head_dim),
        head(HeadKind::Conv { kernel_size: 3 }, head_dim),
        head(HeadKind::Spectral(SpectralTransform::Cosine), head_dim),
    ]
}

fn homogeneous_config(layers: Vec<LayerAttention>, hidden: usize) -> ModelConfig {
    let n = layers.len();
    ModelConfig {
        vocab_size: 40,
        max_position_embeddings: 16,
        hidden_dims: vec![hidden; n],
        ff_dims: vec![vec![hidden * 2]; n],
        attention: AttentionLayout::Homogeneous(
            layers
                .into_iter()
                .map(|attention| UniformLayerSpec {
                    num_heads: 4,
                    attention,
                })
                .collect(),
        ),
        ..ModelConfig::default()
    }
}

fn snapshot(model: &Model) -> BTreeMap<String, Vec<f32>> {
    let mut out = BTreeMap::new();
    model.visit_parameters(&mut |name, view| {
        out.insert(name, view.iter().copied().collect());
    });
    out
}

#[test]
fn test_transfer_mode_parsing() {
    assert_eq!(TransferMode::from_str("OD").unwrap(), TransferMode::Ordered);
    assert_eq!(
        TransferMode::from_str("RP").unwrap(),
        TransferMode::RandomProjection
    );
    assert!(matches!(
        TransferMode::from_str("XX"),
        Err(VefnadError::InvalidConfig(_))
    ));
}

#[test]
fn test_mode_flag_mismatch_rejected() {
    let hetero = hetero_config(vec![mixed_heads(4)], vec![16]);
    let homog = homogeneous_config(
        vec![LayerAttention::SelfAttention(Similarity::DotProduct)],
        16,
    );

    let mut target = build_model(&hetero).unwrap();
    let source = build_model(&homog).unwrap();
    assert!(matches!(
        transfer_weights(&mut target, &source, TransferMode::Ordered),
        Err(VefnadError::InvalidConfig(_))
    ));
}

/// Identical configs: every parameter is rewritten and equals the source
/// exactly, coverage is exactly 1.0.
#[test]
fn test_identity_transfer_heterogeneous() {
    let config = hetero_config(vec![mixed_heads(4), mixed_heads(4)], vec![16, 16]);
    let mut target = build_model(&config).unwrap();
    let source = build_model(&config).unwrap();

    let ratio = transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert_eq!(ratio, 1.0);

    let target_params = snapshot(&target);
    let source_params = snapshot(&source);
    assert_eq!(target_params.len(), source_params.len());
    for (name, values) in &source_params {
        assert_eq!(&target_params[name], values, "mismatch in {}", name);
    }
}

#[test]
fn test_identity_transfer_homogeneous() {
    let config = homogeneous_config(
        vec![
            LayerAttention::SelfAttention(Similarity::Bilinear),
            LayerAttention::Spectral(SpectralTransform::Fourier),
        ],
        16,
    );
    let mut target = build_model(&config).unwrap();
    let source = build_model(&config).unwrap();

    let ratio = transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert_eq!(ratio, 1.0);

    assert_eq!(snapshot(&target), snapshot(&source));
}

/// Ordered subspace copy into a narrower target: every transferred value is
/// the corresponding leading-slice value of the source; nothing indexes out
/// of range.
#[test]
fn test_ordered_subspace_narrower_hidden() {
    let source_config = hetero_config(vec![mixed_heads(4)], vec![32]);
    let target_config = hetero_config(vec![mixed_heads(4)], vec![16]);

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();

    // A strictly narrower target can be fully covered; the ratio only
    // reports how much of the target was rewritten.
    let ratio = transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert!(ratio > 0.0 && ratio <= 1.0, "ratio {}", ratio);

    // Embedding tables: leading columns copied verbatim.
    assert_eq!(
        target.embeddings.word_embeddings.slice(s![.., ..16]),
        source.embeddings.word_embeddings.slice(s![.., ..16])
    );

    // Q projection: per-head rows, leading hidden columns.
    let (AttentionBlock::Hetero(tb), AttentionBlock::Hetero(sb)) = (
        &target.encoder.layers[0].attention.block,
        &source.encoder.layers[0].attention.block,
    ) else {
        panic!("expected heterogeneous blocks");
    };
    assert_eq!(
        tb.query.weight.slice(s![.., ..16]),
        sb.query.weight.slice(s![.., ..16])
    );
}

/// Narrower head_dim: each side is sliced with its own head stride, so
/// source heads are never straddled.
#[test]
fn test_ordered_subspace_narrower_heads() {
    let source_config = hetero_config(vec![mixed_heads(8)], vec![16]);
    let target_config = hetero_config(vec![mixed_heads(4)], vec![16]);

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();

    transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();

    let (AttentionBlock::Hetero(tb), AttentionBlock::Hetero(sb)) = (
        &target.encoder.layers[0].attention.block,
        &source.encoder.layers[0].attention.block,
    ) else {
        panic!("expected heterogeneous blocks");
    };

    // Head 1 of the target (rows 4..8) mirrors the first 4 rows of source
    // head 1 (rows 8..12).
    assert_eq!(
        tb.query.weight.slice(s![4..8, ..]),
        sb.query.weight.slice(s![8..12, ..])
    );

    // Bilinear W: leading block of the source head's W.
    let (HeadOp::Bilinear { w: tw }, HeadOp::Bilinear { w: sw }) =
        (&tb.heads[1], &sb.heads[1])
    else {
        panic!("expected bilinear heads at slot 1");
    };
    assert_eq!(tw.slice(s![..4, ..4]), sw.slice(s![..4, ..4]));
}

/// Random projection: target shapes are never disturbed, outputs stay finite,
/// and the projected region no longer matches a plain truncation.
#[test]
fn test_random_projection_preserves_shape_contracts() {
    let source_config = hetero_config(
        vec![vec![
            head(HeadKind::SelfAttention(Similarity::DotProduct), 4),
            head(HeadKind::SelfAttention(Similarity::Bilinear), 4),
        ]],
        vec![32],
    );
    let target_config = hetero_config(
        vec![vec![
            head(HeadKind::SelfAttention(Similarity::DotProduct), 4),
            head(HeadKind::SelfAttention(Similarity::Bilinear), 4),
        ]],
        vec![16],
    );

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let shapes_before: Vec<_> = target.named_parameters();

    let ratio =
        transfer_weights(&mut target, &source, TransferMode::RandomProjection).unwrap();
    assert!(ratio > 0.0 && ratio <= 1.0);

    assert_eq!(target.named_parameters(), shapes_before);
    let mut all_finite = true;
    target.visit_parameters(&mut |_, view| {
        all_finite &= view.iter().all(|v| v.is_finite());
    });
    assert!(all_finite);
}

/// Heads whose type tags disagree at the same index are never copied.
#[test]
fn test_mismatched_head_types_left_at_initialization() {
    let source_config = hetero_config(
        vec![vec![
            head(HeadKind::SelfAttention(Similarity::DotProduct), 4),
            head(HeadKind::SelfAttention(Similarity::Bilinear), 4),
        ]],
        vec![16],
    );
    let target_config = hetero_config(
        vec![vec![
            head(HeadKind::Conv { kernel_size: 3 }, 4),
            head(HeadKind::SelfAttention(Similarity::Bilinear), 4),
        ]],
        vec![16],
    );

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let before = snapshot(&target);

    transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    let after = snapshot(&target);

    // Slot 0 (conv vs sa): conv parameters and the Q/K/V rows of head 0 are
    // untouched.
    for name in before.keys().filter(|n| n.contains("heads.0")) {
        assert_eq!(before[name], after[name], "{} was overwritten", name);
    }
    let (AttentionBlock::Hetero(tb), AttentionBlock::Hetero(sb)) = (
        &target.encoder.layers[0].attention.block,
        &source.encoder.layers[0].attention.block,
    ) else {
        panic!("expected heterogeneous blocks");
    };
    assert_ne!(
        tb.query.weight.slice(s![..4, ..]),
        sb.query.weight.slice(s![..4, ..])
    );

    // Slot 1 (both bilinear) transferred.
    assert_eq!(
        tb.query.weight.slice(s![4..8, ..]),
        sb.query.weight.slice(s![4..8, ..])
    );
}

/// Conv kernel reconciliation is explicitly unimplemented under random
/// projection and must raise, not silently skip.
#[test]
fn test_rp_conv_kernel_mismatch_raises() {
    let source_config = hetero_config(
        vec![vec![head(HeadKind::Conv { kernel_size: 5 }, 4)]],
        vec![16],
    );
    let target_config = hetero_config(
        vec![vec![head(HeadKind::Conv { kernel_size: 3 }, 4)]],
        vec![16],
    );

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();

    let result = transfer_weights(&mut target, &source, TransferMode::RandomProjection);
    assert!(matches!(result, Err(VefnadError::ShapeMismatch { .. })));

    // Ordered mode reconciles the same pair by kernel resampling.
    let mut target = build_model(&target_config).unwrap();
    assert!(transfer_weights(&mut target, &source, TransferMode::Ordered).is_ok());
}

/// Homogeneous transfer aborts at the first attention-type mismatch: layers
/// before it transfer fully, the mismatched layer and everything after stay
/// at initialization.
#[test]
fn test_homogeneous_abort_on_type_mismatch() {
    let source_config = homogeneous_config(
        vec![
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::Spectral(SpectralTransform::Fourier),
            LayerAttention::SelfAttention(Similarity::DotProduct),
        ],
        16,
    );
    let target_config = homogeneous_config(
        vec![
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
        ],
        16,
    );

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let before = snapshot(&target);

    let ratio = transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert!(ratio > 0.0 && ratio < 1.0);
    let after = snapshot(&target);
    let source_params = snapshot(&source);

    for name in before.keys() {
        if name.starts_with("encoder.layer.0") || name.starts_with("encoder.layer.1") {
            assert_eq!(after[name], source_params[name], "{} not transferred", name);
        }
        if name.starts_with("encoder.layer.2") || name.starts_with("encoder.layer.3") {
            assert_eq!(after[name], before[name], "{} should be untouched", name);
        }
    }
}

/// Structural mismatch in the middle of a homogeneous stack skips that layer
/// but does not abort (only a type mismatch aborts).
#[test]
fn test_homogeneous_structural_mismatch_skips_single_layer() {
    let mut source_config = homogeneous_config(
        vec![
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
            LayerAttention::SelfAttention(Similarity::DotProduct),
        ],
        16,
    );
    let target_config = source_config.clone();
    // Source layer 1 gets a different head count; type tag still "sa".
    if let AttentionLayout::Homogeneous(specs) = &mut source_config.attention {
        specs[1].num_heads = 2;
    }

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let before = snapshot(&target);

    transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    let after = snapshot(&target);
    let source_params = snapshot(&source);

    for name in before.keys() {
        if name.contains("layer.1.attention") {
            assert_eq!(after[name], before[name], "{} should be untouched", name);
        }
        if name.contains("layer.2.attention") {
            assert_eq!(after[name], source_params[name], "{} not transferred", name);
        }
    }
}

/// The source model is never mutated.
#[test]
fn test_source_is_never_mutated() {
    let source_config = hetero_config(vec![mixed_heads(8)], vec![32]);
    let target_config = hetero_config(vec![mixed_heads(4)], vec![16]);

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let source_before = snapshot(&source);

    transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert_eq!(snapshot(&source), source_before);
}

/// Diverging layer counts: transfer stops at min(num_layers); the extra
/// target layers keep their initialization.
#[test]
fn test_extra_target_layers_untouched() {
    let source_config = hetero_config(vec![mixed_heads(4)], vec![16]);
    let target_config = hetero_config(vec![mixed_heads(4), mixed_heads(4)], vec![16, 16]);

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    let before = snapshot(&target);

    let ratio = transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();
    assert!(ratio < 1.0);

    let after = snapshot(&target);
    for name in before.keys().filter(|n| n.starts_with("encoder.layer.1")) {
        assert_eq!(before[name], after[name], "{} should be untouched", name);
    }
}

/// A narrower target still runs after transfer: end-to-end sanity.
#[test]
fn test_transferred_model_forward_works() {
    let source_config = hetero_config(vec![mixed_heads(8)], vec![32]);
    let target_config = hetero_config(vec![mixed_heads(4)], vec![16]);

    let source = build_model(&source_config).unwrap();
    let mut target = build_model(&target_config).unwrap();
    transfer_weights(&mut target, &source, TransferMode::Ordered).unwrap();

    let ids = ndarray::arr2(&[[1_usize, 2, 3, 4]]);
    let out = target
        .forward(crate::model::ModelInputs {
            input_ids: Some(&ids),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(out.last_hidden_state.dim(), (1, 4, 16));
    assert!(out.last_hidden_state.iter().all(|v| v.is_finite()));
}
