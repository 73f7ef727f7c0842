//! Error types for vefnad.

use thiserror::Error;

/// Errors surfaced by model construction and weight transfer.
///
/// Intentionally skipped transfers (head type mismatch, diverging layer counts)
/// are not errors; they only show up in the coverage ratio returned by
/// [`crate::transfer::transfer_weights`].
#[derive(Debug, Error)]
pub enum VefnadError {
    /// A shape invariant was violated before any tensor was allocated.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The transfer engine has no rule for reconciling these shapes.
    #[error("cannot reconcile shapes for '{parameter}': {detail}")]
    ShapeMismatch { parameter: String, detail: String },

    /// Forward-pass failure (reshape, dimension mismatch).
    #[error("inference failed: {0}")]
    Inference(#[from] anyhow::Error),
}

/// Result type for vefnad operations.
pub type VefnadResult<T> = Result<T, VefnadError>;
