//! FLAME model operator
//!
//! The morphable model is consumed as a fixed external operator: an NPZ asset
//! decoded by [`assets`] and evaluated differentiably by [`flame`] on the
//! autodiff backend. The fitter only ever sees `(shape, expression, pose)` →
//! vertices.

pub mod assets;
pub mod flame;

pub use assets::{FlameAsset, LandmarkEmbeddingAsset};
pub use flame::{rodrigues, FlameModel};

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Autodiff backend used for model evaluation and loss assembly.
pub type FitBackend = burn_autodiff::Autodiff<burn_ndarray::NdArray<f32>>;
/// The non-tracked inner backend gradients are read back on.
pub type InnerBackend = burn_ndarray::NdArray<f32>;
pub type FitDevice = burn_ndarray::NdArrayDevice;

/// Process-level asset locations, initialized once at startup and never
/// mutated.
pub static DEFAULT_MODEL_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("FACE_FORGE_MODEL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("assets/flame_generic.npz"))
});

pub static DEFAULT_EMBEDDING_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("FACE_FORGE_EMBEDDING")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("assets/landmark_embedding.npz"))
});
