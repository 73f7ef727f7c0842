//! Cross-architecture parameter transfer.
//!
//! Mutates a freshly built target model in place using weights from a source
//! model of possibly different shape, maximizing the fraction of parameters
//! that carry trained signal. The walk is a typed recursion mirroring the
//! model tree (embeddings → layers → heads → feed-forward → pooler); every
//! visit step is a statically known case. The source is never mutated.
//!
//! Skipped tensors (mismatched head types, diverging layer counts) keep their
//! random initialization and surface only through the returned coverage
//! ratio. Shapes the engine has no rule for raise `ShapeMismatch`.

pub mod projection;

#[cfg(test)]
mod tests;

use std::str::FromStr;

use log::debug;
use ndarray::s;
use serde::{Deserialize, Serialize};

use crate::attention::conv::resample_kernel;
use crate::attention::{Attention, AttentionBlock, ConvHead, HeadOp, HeteroAttention};
use crate::config::AttentionLayout;
use crate::dense::Dense;
use crate::encoder::EncoderLayer;
use crate::error::{VefnadError, VefnadResult};
use crate::model::Model;
use crate::normalization::LayerNorm;

use projection::GaussianProjection;

/// Strategy for reconciling tensors whose shapes differ along some axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Ordered subspace copy: the element-wise overlapping leading sub-block.
    #[serde(rename = "OD")]
    Ordered,
    /// Gaussian random projection down to the smaller dimension.
    #[serde(rename = "RP")]
    RandomProjection,
}

impl FromStr for TransferMode {
    type Err = VefnadError;

    fn from_str(s: &str) -> VefnadResult<Self> {
        match s {
            "OD" => Ok(TransferMode::Ordered),
            "RP" => Ok(TransferMode::RandomProjection),
            other => Err(VefnadError::InvalidConfig(format!(
                "transfer mode must be one of OD, RP; got '{}'",
                other
            ))),
        }
    }
}

/// Elementwise coverage ledger: written values over the full parameter set.
struct Coverage {
    total: usize,
    written: usize,
}

impl Coverage {
    fn record(&mut self, elements: usize) {
        self.written += elements;
    }

    fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.written as f64 / self.total as f64
    }
}

/// Per-layer shape context shared by the visit steps.
#[derive(Clone, Copy)]
struct LayerCtx {
    mode: TransferMode,
    layer_idx: usize,
    d_t: usize,
    d_s: usize,
    lower_d: usize,
    h_t: usize,
    h_s: usize,
    lower_hidden: usize,
    all_t: usize,
    all_s: usize,
}

impl LayerCtx {
    fn hidden_eq(&self) -> bool {
        self.h_t == self.h_s
    }

    fn head_dim_eq(&self) -> bool {
        self.d_t == self.d_s
    }
}

/// Transfer weights from `source` into `target` and return the coverage
/// ratio: the fraction of target parameter values rewritten from their random
/// initialization.
pub fn transfer_weights(
    target: &mut Model,
    source: &Model,
    mode: TransferMode,
) -> VefnadResult<f64> {
    if target.config.attention.is_heterogeneous() != source.config.attention.is_heterogeneous() {
        return Err(VefnadError::InvalidConfig(
            "source and target must agree on heterogeneous mode".into(),
        ));
    }

    let mut cov = Coverage {
        total: target.num_parameters(),
        written: 0,
    };

    transfer_embeddings(target, source, mode, &mut cov);

    if target.config.attention.is_heterogeneous() {
        transfer_hetero_layers(target, source, mode, &mut cov)?;
    } else {
        transfer_homogeneous_layers(target, source, &mut cov);
    }

    transfer_pooler(target, source, &mut cov);

    let ratio = cov.ratio();
    debug!(
        "transfer complete: {}/{} values written (coverage {:.4})",
        cov.written, cov.total, ratio
    );
    Ok(ratio)
}

// ---------------------------------------------------------------------------
// Shared copy primitives
// ---------------------------------------------------------------------------

fn copy_2d_full(dst: &mut ndarray::Array2<f32>, src: &ndarray::Array2<f32>, cov: &mut Coverage) {
    debug_assert_eq!(dst.dim(), src.dim());
    dst.assign(src);
    cov.record(src.len());
}

fn copy_2d_block(
    dst: &mut ndarray::Array2<f32>,
    src: &ndarray::Array2<f32>,
    rows: usize,
    cols: usize,
    cov: &mut Coverage,
) {
    dst.slice_mut(s![..rows, ..cols])
        .assign(&src.slice(s![..rows, ..cols]));
    cov.record(rows * cols);
}

fn write_2d_block(
    dst: &mut ndarray::Array2<f32>,
    block: &ndarray::Array2<f32>,
    cov: &mut Coverage,
) {
    let (rows, cols) = block.dim();
    dst.slice_mut(s![..rows, ..cols]).assign(block);
    cov.record(rows * cols);
}

fn copy_1d_full(dst: &mut ndarray::Array1<f32>, src: &ndarray::Array1<f32>, cov: &mut Coverage) {
    debug_assert_eq!(dst.len(), src.len());
    dst.assign(src);
    cov.record(src.len());
}

fn copy_1d_prefix(
    dst: &mut ndarray::Array1<f32>,
    src: &ndarray::Array1<f32>,
    len: usize,
    cov: &mut Coverage,
) {
    dst.slice_mut(s![..len]).assign(&src.slice(s![..len]));
    cov.record(len);
}

fn copy_dense_full(dst: &mut Dense, src: &Dense, cov: &mut Coverage) {
    copy_2d_full(&mut dst.weight, &src.weight, cov);
    if let (Some(db), Some(sb)) = (dst.bias.as_mut(), src.bias.as_ref()) {
        copy_1d_full(db, sb, cov);
    }
}

fn copy_layer_norm_full(dst: &mut LayerNorm, src: &LayerNorm, cov: &mut Coverage) {
    copy_1d_full(&mut dst.weight, &src.weight, cov);
    copy_1d_full(&mut dst.bias, &src.bias, cov);
}

fn copy_layer_norm_prefix(dst: &mut LayerNorm, src: &LayerNorm, len: usize, cov: &mut Coverage) {
    copy_1d_prefix(&mut dst.weight, &src.weight, len, cov);
    copy_1d_prefix(&mut dst.bias, &src.bias, len, cov);
}

/// `transpose ∘ project ∘ transpose`: reduce the row axis of a `[rows, cols]`
/// matrix through a fresh Gaussian projection fit on the transposed view.
fn project_rows(src: &ndarray::ArrayView2<f32>, n_components: usize) -> ndarray::Array2<f32> {
    let transposed = src.t().as_standard_layout().to_owned();
    let projected = GaussianProjection::new(n_components).fit_transform(&transposed.view());
    projected.t().as_standard_layout().to_owned()
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

fn transfer_embeddings(target: &mut Model, source: &Model, mode: TransferMode, cov: &mut Coverage) {
    let h_t = target.config.hidden_dims[0];
    let h_s = source.config.hidden_dims[0];
    let lower = h_t.min(h_s);

    let t = &mut target.embeddings;
    let s = &source.embeddings;

    if h_t == h_s {
        debug!("loading embeddings directly");
        let vocab = t.word_embeddings.shape()[0].min(s.word_embeddings.shape()[0]);
        copy_2d_block(&mut t.word_embeddings, &s.word_embeddings, vocab, h_t, cov);
        let positions = t.position_embeddings.shape()[0].min(s.position_embeddings.shape()[0]);
        copy_2d_block(&mut t.position_embeddings, &s.position_embeddings, positions, h_t, cov);
        let types = t.token_type_embeddings.shape()[0].min(s.token_type_embeddings.shape()[0]);
        copy_2d_block(&mut t.token_type_embeddings, &s.token_type_embeddings, types, h_t, cov);
        copy_layer_norm_full(&mut t.layer_norm, &s.layer_norm, cov);
        return;
    }

    debug!("transferring embeddings with width {} -> {}", h_s, h_t);
    copy_layer_norm_prefix(&mut t.layer_norm, &s.layer_norm, lower, cov);

    let tables: [(&mut ndarray::Array2<f32>, &ndarray::Array2<f32>); 3] = [
        (&mut t.word_embeddings, &s.word_embeddings),
        (&mut t.position_embeddings, &s.position_embeddings),
        (&mut t.token_type_embeddings, &s.token_type_embeddings),
    ];
    for (dst, src) in tables {
        let rows = dst.shape()[0].min(src.shape()[0]);
        match mode {
            TransferMode::Ordered => copy_2d_block(dst, src, rows, lower, cov),
            TransferMode::RandomProjection => {
                let sub = src.slice(s![..rows, ..lower]).to_owned();
                let projected = GaussianProjection::new(lower).fit_transform(&sub.view());
                write_2d_block(dst, &projected, cov);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Heterogeneous layers
// ---------------------------------------------------------------------------

fn transfer_hetero_layers(
    target: &mut Model,
    source: &Model,
    mode: TransferMode,
    cov: &mut Coverage,
) -> VefnadResult<()> {
    let min_layers = target.config.num_layers().min(source.config.num_layers());

    for i in 0..min_layers {
        let ctx = LayerCtx {
            mode,
            layer_idx: i,
            d_t: target.config.head_dim(i),
            d_s: source.config.head_dim(i),
            lower_d: target.config.head_dim(i).min(source.config.head_dim(i)),
            h_t: target.config.hidden_dims[i],
            h_s: source.config.hidden_dims[i],
            lower_hidden: target.config.hidden_dims[i].min(source.config.hidden_dims[i]),
            all_t: target.config.all_head_size(i),
            all_s: source.config.all_head_size(i),
        };
        debug!("checking layer {}", i);

        let t_layer = &mut target.encoder.layers[i];
        let s_layer = &source.encoder.layers[i];

        transfer_hetero_attention(&mut t_layer.attention, &s_layer.attention, &ctx, cov)?;
        if let (Some(t_cross), Some(s_cross)) =
            (t_layer.cross_attention.as_mut(), s_layer.cross_attention.as_ref())
        {
            transfer_hetero_attention(t_cross, s_cross, &ctx, cov)?;
        }

        transfer_feed_forward(t_layer, s_layer, &ctx, cov);
    }
    Ok(())
}

fn transfer_hetero_attention(
    t_attn: &mut Attention,
    s_attn: &Attention,
    ctx: &LayerCtx,
    cov: &mut Coverage,
) -> VefnadResult<()> {
    let (AttentionBlock::Hetero(tb), AttentionBlock::Hetero(sb)) =
        (&mut t_attn.block, &s_attn.block)
    else {
        return Err(VefnadError::InvalidConfig(
            "heterogeneous transfer requires heterogeneous attention blocks".into(),
        ));
    };

    let matched = transfer_hetero_block(tb, sb, ctx, cov)?;
    transfer_attention_output(t_attn, s_attn, &matched, ctx, cov);
    Ok(())
}

fn transfer_hetero_block(
    tb: &mut HeteroAttention,
    sb: &HeteroAttention,
    ctx: &LayerCtx,
    cov: &mut Coverage,
) -> VefnadResult<Vec<usize>> {
    // Relative-position distance embedding first: later steps assume its
    // width is settled.
    if let (Some(t_rel), Some(s_rel)) = (tb.relative.as_mut(), sb.relative.as_ref()) {
        if ctx.head_dim_eq() && t_rel.table.dim() == s_rel.table.dim() {
            debug!("loading distance embeddings directly");
            copy_2d_full(&mut t_rel.table, &s_rel.table, cov);
        } else {
            match ctx.mode {
                TransferMode::Ordered => {
                    let rows = t_rel.table.shape()[0].min(s_rel.table.shape()[0]);
                    copy_2d_block(&mut t_rel.table, &s_rel.table, rows, ctx.lower_d, cov);
                }
                TransferMode::RandomProjection => {
                    let projected =
                        GaussianProjection::new(ctx.lower_d).fit_transform(&s_rel.table.view());
                    let rows = t_rel.table.shape()[0].min(projected.shape()[0]);
                    let block = projected.slice(s![..rows, ..]).to_owned();
                    write_2d_block(&mut t_rel.table, &block, cov);
                }
            }
        }
    }

    let mut matched = Vec::new();
    let num_heads = tb.heads.len().min(sb.heads.len());
    for j in 0..num_heads {
        if tb.heads[j].kind().type_tag() != sb.heads[j].kind().type_tag() {
            debug!(
                "layer {} head {}: type {} != {}, leaving at initialization",
                ctx.layer_idx,
                j,
                tb.heads[j].kind().type_tag(),
                sb.heads[j].kind().type_tag()
            );
            continue;
        }
        matched.push(j);
        debug!("transferring attention head {} of layer {}", j, ctx.layer_idx);

        transfer_head_qkv(&mut tb.query, &sb.query, j, ctx, cov);
        transfer_head_qkv(&mut tb.key, &sb.key, j, ctx, cov);
        transfer_head_qkv(&mut tb.value, &sb.value, j, ctx, cov);

        match (&mut tb.heads[j], &sb.heads[j]) {
            (HeadOp::Bilinear { w: tw }, HeadOp::Bilinear { w: sw }) => {
                transfer_bilinear(tw, sw, ctx, cov);
            }
            (HeadOp::Conv(tc), HeadOp::Conv(sc)) => {
                transfer_conv_head(tc, sc, j, ctx, cov)?;
            }
            // Same tag, different similarity (sdp vs wma) or spectral pair:
            // Q/K/V slices moved above, no variant parameters to reconcile.
            _ => {}
        }
    }

    Ok(matched)
}

/// Move one head's Q/K/V row slices. Weights are `[all_head_size, hidden]`;
/// each side is sliced with its own head stride so source heads are never
/// straddled.
fn transfer_head_qkv(dst: &mut Dense, src: &Dense, j: usize, ctx: &LayerCtx, cov: &mut Coverage) {
    let rows_t = j * ctx.d_t..j * ctx.d_t + ctx.lower_d;
    let rows_s = j * ctx.d_s..j * ctx.d_s + ctx.lower_d;

    if let (Some(db), Some(sb)) = (dst.bias.as_mut(), src.bias.as_ref()) {
        db.slice_mut(s![rows_t.clone()])
            .assign(&sb.slice(s![rows_s.clone()]));
        cov.record(ctx.lower_d);
    }

    if ctx.hidden_eq() {
        dst.weight
            .slice_mut(s![rows_t, ..])
            .assign(&src.weight.slice(s![rows_s, ..]));
        cov.record(ctx.lower_d * ctx.h_t);
        return;
    }

    match ctx.mode {
        TransferMode::Ordered => {
            dst.weight
                .slice_mut(s![rows_t, ..ctx.lower_hidden])
                .assign(&src.weight.slice(s![rows_s, ..ctx.lower_hidden]));
        }
        TransferMode::RandomProjection => {
            let sub = src
                .weight
                .slice(s![rows_s, ..ctx.lower_hidden])
                .to_owned();
            let projected =
                GaussianProjection::new(ctx.lower_hidden).fit_transform(&sub.view());
            dst.weight
                .slice_mut(s![rows_t, ..ctx.lower_hidden])
                .assign(&projected);
        }
    }
    cov.record(ctx.lower_d * ctx.lower_hidden);
}

fn transfer_bilinear(
    tw: &mut ndarray::Array2<f32>,
    sw: &ndarray::Array2<f32>,
    ctx: &LayerCtx,
    cov: &mut Coverage,
) {
    if ctx.head_dim_eq() {
        copy_2d_full(tw, sw, cov);
        return;
    }
    match ctx.mode {
        TransferMode::Ordered => {
            copy_2d_block(tw, sw, ctx.lower_d, ctx.lower_d, cov);
        }
        TransferMode::RandomProjection => {
            // Project both axes down: W -> W·Cᵀ, then the transpose again.
            let rp = GaussianProjection::new(ctx.lower_d);
            let once = rp.fit_transform(&sw.view());
            let once_t = once.t().as_standard_layout().to_owned();
            let twice = rp.fit_transform(&once_t.view());
            write_2d_block(tw, &twice, cov);
        }
    }
}

fn transfer_conv_head(
    tc: &mut ConvHead,
    sc: &ConvHead,
    j: usize,
    ctx: &LayerCtx,
    cov: &mut Coverage,
) -> VefnadResult<()> {
    if ctx.head_dim_eq() && tc.kernel_size == sc.kernel_size {
        copy_2d_full(&mut tc.key_conv.depthwise, &sc.key_conv.depthwise, cov);
        copy_2d_full(&mut tc.key_conv.pointwise, &sc.key_conv.pointwise, cov);
        copy_1d_full(&mut tc.key_conv.bias, &sc.key_conv.bias, cov);
        copy_dense_full(&mut tc.kernel_dense, &sc.kernel_dense, cov);
        copy_dense_full(&mut tc.out_dense, &sc.out_dense, cov);
        return Ok(());
    }

    if ctx.mode == TransferMode::RandomProjection {
        // No projection rule exists for kernel-tap reconciliation; raising is
        // deliberate, a silent skip would be indistinguishable from a no-op.
        return Err(VefnadError::ShapeMismatch {
            parameter: format!(
                "encoder.layer.{}.attention.self.heads.{}.key_conv",
                ctx.layer_idx, j
            ),
            detail: format!(
                "random-projection reconciliation of conv kernels is not implemented \
                 (head_dim {} -> {}, kernel {} -> {})",
                ctx.d_s, ctx.d_t, sc.kernel_size, tc.kernel_size
            ),
        });
    }

    let lower_k = tc.kernel_size.min(sc.kernel_size);

    copy_1d_prefix(&mut tc.key_conv.bias, &sc.key_conv.bias, ctx.lower_d, cov);

    let depthwise_rows = sc.key_conv.depthwise.slice(s![..ctx.lower_d, ..]).to_owned();
    let resampled = resample_kernel(&depthwise_rows, lower_k);
    write_2d_block(&mut tc.key_conv.depthwise, &resampled, cov);

    copy_2d_block(
        &mut tc.key_conv.pointwise,
        &sc.key_conv.pointwise,
        ctx.lower_d,
        ctx.lower_d,
        cov,
    );

    copy_2d_block(
        &mut tc.kernel_dense.weight,
        &sc.kernel_dense.weight,
        lower_k,
        ctx.lower_d,
        cov,
    );
    if let (Some(db), Some(sb)) = (tc.kernel_dense.bias.as_mut(), sc.kernel_dense.bias.as_ref()) {
        copy_1d_prefix(db, sb, lower_k, cov);
    }

    copy_2d_block(
        &mut tc.out_dense.weight,
        &sc.out_dense.weight,
        ctx.lower_d,
        ctx.lower_d,
        cov,
    );
    if let (Some(db), Some(sb)) = (tc.out_dense.bias.as_mut(), sc.out_dense.bias.as_ref()) {
        copy_1d_prefix(db, sb, ctx.lower_d, cov);
    }

    Ok(())
}

/// Attention output projection and normalization: `[hidden, all_head_size]`
/// weights moved per matched head column block.
fn transfer_attention_output(
    t_attn: &mut Attention,
    s_attn: &Attention,
    matched: &[usize],
    ctx: &LayerCtx,
    cov: &mut Coverage,
) {
    let t_out = &mut t_attn.output;
    let s_out = &s_attn.output;

    if ctx.all_t == ctx.all_s && ctx.hidden_eq() {
        copy_dense_full(&mut t_out.dense, &s_out.dense, cov);
        copy_layer_norm_full(&mut t_out.layer_norm, &s_out.layer_norm, cov);
        return;
    }

    if let (Some(db), Some(sb)) = (t_out.dense.bias.as_mut(), s_out.dense.bias.as_ref()) {
        copy_1d_prefix(db, sb, ctx.lower_hidden, cov);
    }

    for &j in matched {
        let cols_t = j * ctx.d_t..j * ctx.d_t + ctx.lower_d;
        let cols_s = j * ctx.d_s..j * ctx.d_s + ctx.lower_d;

        if ctx.hidden_eq() {
            t_out
                .dense
                .weight
                .slice_mut(s![.., cols_t])
                .assign(&s_out.dense.weight.slice(s![.., cols_s]));
            cov.record(ctx.h_t * ctx.lower_d);
        } else {
            match ctx.mode {
                TransferMode::Ordered => {
                    t_out
                        .dense
                        .weight
                        .slice_mut(s![..ctx.lower_hidden, cols_t])
                        .assign(&s_out.dense.weight.slice(s![..ctx.lower_hidden, cols_s]));
                }
                TransferMode::RandomProjection => {
                    let sub = s_out.dense.weight.slice(s![..ctx.lower_hidden, cols_s]);
                    let projected = project_rows(&sub, ctx.lower_hidden);
                    t_out
                        .dense
                        .weight
                        .slice_mut(s![..ctx.lower_hidden, cols_t])
                        .assign(&projected);
                }
            }
            cov.record(ctx.lower_hidden * ctx.lower_d);
        }
    }

    if ctx.hidden_eq() {
        copy_layer_norm_full(&mut t_out.layer_norm, &s_out.layer_norm, cov);
    } else {
        copy_layer_norm_prefix(&mut t_out.layer_norm, &s_out.layer_norm, ctx.lower_hidden, cov);
    }
}

/// Feed-forward stages, output projection/normalization and the inter-layer
/// width-matching projection.
fn transfer_feed_forward(
    t_layer: &mut EncoderLayer,
    s_layer: &EncoderLayer,
    ctx: &LayerCtx,
    cov: &mut Coverage,
) {
    // Stage weights reconcile by leading sub-block in both modes.
    let stages = t_layer
        .intermediate
        .stages
        .len()
        .min(s_layer.intermediate.stages.len());
    for f in 0..stages {
        debug!("transferring feed-forward stage {} of layer {}", f, ctx.layer_idx);
        let t_stage = &mut t_layer.intermediate.stages[f];
        let s_stage = &s_layer.intermediate.stages[f];

        let rows = t_stage.out_features().min(s_stage.out_features());
        let cols = t_stage.in_features().min(s_stage.in_features());
        copy_2d_block(&mut t_stage.weight, &s_stage.weight, rows, cols, cov);
        if let (Some(db), Some(sb)) = (t_stage.bias.as_mut(), s_stage.bias.as_ref()) {
            copy_1d_prefix(db, sb, rows, cov);
        }
    }

    // Output dense: [hidden, ff_last].
    let t_dense = &mut t_layer.output.dense;
    let s_dense = &s_layer.output.dense;
    let out_lower = t_dense.in_features().min(s_dense.in_features());

    if let (Some(db), Some(sb)) = (t_dense.bias.as_mut(), s_dense.bias.as_ref()) {
        copy_1d_prefix(db, sb, ctx.lower_hidden, cov);
    }

    if ctx.hidden_eq() {
        t_dense
            .weight
            .slice_mut(s![.., ..out_lower])
            .assign(&s_dense.weight.slice(s![.., ..out_lower]));
        cov.record(ctx.h_t * out_lower);
    } else {
        match ctx.mode {
            TransferMode::Ordered => {
                t_dense
                    .weight
                    .slice_mut(s![..ctx.lower_hidden, ..out_lower])
                    .assign(&s_dense.weight.slice(s![..ctx.lower_hidden, ..out_lower]));
            }
            TransferMode::RandomProjection => {
                let sub = s_dense.weight.slice(s![..ctx.lower_hidden, ..out_lower]);
                let projected = project_rows(&sub, ctx.lower_hidden);
                t_dense
                    .weight
                    .slice_mut(s![..ctx.lower_hidden, ..out_lower])
                    .assign(&projected);
            }
        }
        cov.record(ctx.lower_hidden * out_lower);
    }

    if ctx.hidden_eq() {
        copy_layer_norm_full(&mut t_layer.output.layer_norm, &s_layer.output.layer_norm, cov);
    } else {
        copy_layer_norm_prefix(
            &mut t_layer.output.layer_norm,
            &s_layer.output.layer_norm,
            ctx.lower_hidden,
            cov,
        );
    }

    // Inter-layer width projection, when both sides carry one.
    if let (Some(t_proj), Some(s_proj)) =
        (t_layer.output.projection.as_mut(), s_layer.output.projection.as_ref())
    {
        if t_proj.weight.dim() == s_proj.weight.dim() {
            copy_dense_full(t_proj, s_proj, cov);
        } else {
            let rows = t_proj.out_features().min(s_proj.out_features());
            let cols = t_proj.in_features().min(s_proj.in_features());
            copy_2d_block(&mut t_proj.weight, &s_proj.weight, rows, cols, cov);
            if let (Some(db), Some(sb)) = (t_proj.bias.as_mut(), s_proj.bias.as_ref()) {
                copy_1d_prefix(db, sb, rows, cov);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Homogeneous layers
// ---------------------------------------------------------------------------

/// Conservative all-or-nothing per-layer transfer. The first attention-type
/// mismatch aborts this and every subsequent layer.
fn transfer_homogeneous_layers(target: &mut Model, source: &Model, cov: &mut Coverage) {
    let min_layers = target.config.num_layers().min(source.config.num_layers());

    let (
        AttentionLayout::Homogeneous(t_specs),
        AttentionLayout::Homogeneous(s_specs),
    ) = (
        target.config.attention.clone(),
        source.config.attention.clone(),
    )
    else {
        unreachable!("checked by transfer_weights");
    };

    for i in 0..min_layers {
        let t_spec = t_specs[i];
        let s_spec = s_specs[i];

        if t_spec.attention.type_tag() != s_spec.attention.type_tag() {
            debug!(
                "attention type mismatch at layer {} ({} vs {}), aborting transfer \
                 for this and all subsequent layers",
                i,
                t_spec.attention.type_tag(),
                s_spec.attention.type_tag()
            );
            break;
        }

        let hidden_eq = target.config.hidden_dims[i] == source.config.hidden_dims[i];
        let attention_eq =
            hidden_eq && t_spec.num_heads == s_spec.num_heads && t_spec.attention == s_spec.attention;
        if !attention_eq {
            debug!("layer {} differs structurally, leaving at initialization", i);
            continue;
        }

        let t_layer = &mut target.encoder.layers[i];
        let s_layer = &source.encoder.layers[i];

        copy_uniform_attention(&mut t_layer.attention, &s_layer.attention, cov);
        if let (Some(t_cross), Some(s_cross)) =
            (t_layer.cross_attention.as_mut(), s_layer.cross_attention.as_ref())
        {
            copy_uniform_attention(t_cross, s_cross, cov);
        }

        if target.config.ff_dims[i] != source.config.ff_dims[i] {
            continue;
        }
        for (t_stage, s_stage) in t_layer
            .intermediate
            .stages
            .iter_mut()
            .zip(&s_layer.intermediate.stages)
        {
            copy_dense_full(t_stage, s_stage, cov);
        }

        copy_dense_full(&mut t_layer.output.dense, &s_layer.output.dense, cov);
        copy_layer_norm_full(&mut t_layer.output.layer_norm, &s_layer.output.layer_norm, cov);
        if let (Some(t_proj), Some(s_proj)) =
            (t_layer.output.projection.as_mut(), s_layer.output.projection.as_ref())
        {
            if t_proj.weight.dim() == s_proj.weight.dim() {
                copy_dense_full(t_proj, s_proj, cov);
            }
        }
    }
}

/// Exact whole-block copy for structurally identical homogeneous layers.
fn copy_uniform_attention(t_attn: &mut Attention, s_attn: &Attention, cov: &mut Coverage) {
    match (&mut t_attn.block, &s_attn.block) {
        (AttentionBlock::Uniform(tb), AttentionBlock::Uniform(sb)) => {
            copy_dense_full(&mut tb.query, &sb.query, cov);
            copy_dense_full(&mut tb.key, &sb.key, cov);
            copy_dense_full(&mut tb.value, &sb.value, cov);
            if let (Some(tw), Some(sw)) = (tb.w.as_mut(), sb.w.as_ref()) {
                copy_2d_full(tw, sw, cov);
            }
            if let (Some(tr), Some(sr)) = (tb.relative.as_mut(), sb.relative.as_ref()) {
                if tr.table.dim() == sr.table.dim() {
                    copy_2d_full(&mut tr.table, &sr.table, cov);
                }
            }
        }
        (AttentionBlock::Spectral(tb), AttentionBlock::Spectral(sb)) => {
            copy_dense_full(&mut tb.query, &sb.query, cov);
            copy_dense_full(&mut tb.key, &sb.key, cov);
            copy_dense_full(&mut tb.value, &sb.value, cov);
            if let (Some(tr), Some(sr)) = (tb.relative.as_mut(), sb.relative.as_ref()) {
                if tr.table.dim() == sr.table.dim() {
                    copy_2d_full(&mut tr.table, &sr.table, cov);
                }
            }
        }
        _ => {
            debug!("homogeneous block variants disagree, leaving at initialization");
            return;
        }
    }

    copy_dense_full(&mut t_attn.output.dense, &s_attn.output.dense, cov);
    copy_layer_norm_full(&mut t_attn.output.layer_norm, &s_attn.output.layer_norm, cov);
}

// ---------------------------------------------------------------------------
// Pooler
// ---------------------------------------------------------------------------

fn transfer_pooler(target: &mut Model, source: &Model, cov: &mut Coverage) {
    let (Some(t_pooler), Some(s_pooler)) = (target.pooler.as_mut(), source.pooler.as_ref()) else {
        return;
    };

    if t_pooler.dense.weight.dim() == s_pooler.dense.weight.dim() {
        copy_dense_full(&mut t_pooler.dense, &s_pooler.dense, cov);
    } else {
        let lower = t_pooler
            .dense
            .out_features()
            .min(s_pooler.dense.out_features());
        copy_2d_block(&mut t_pooler.dense.weight, &s_pooler.dense.weight, lower, lower, cov);
        if let (Some(db), Some(sb)) =
            (t_pooler.dense.bias.as_mut(), s_pooler.dense.bias.as_ref())
        {
            copy_1d_prefix(db, sb, lower, cov);
        }
    }
}
