// Core modules
pub mod config;
pub mod error;
pub mod geometry;
pub mod job;
pub mod landmarks;
pub mod model;
pub mod units;

// Numerical subsystems
pub mod fitter;
pub mod nonrigid;

// Metrics, QC and orchestration
pub mod metrics;
pub mod pipeline;
pub mod qc;

// Artifact I/O
pub mod io;

pub use config::Config;
pub use error::{FaceForgeError, Result};
pub use fitter::{FlameParams, ModelFitter, StageRecord};
pub use geometry::PointCloud;
pub use job::CancelToken;
pub use landmarks::LandmarkEmbedding;
pub use model::{FlameAsset, FlameModel, LandmarkEmbeddingAsset};
pub use nonrigid::NonRigidResult;
pub use pipeline::{FitPipeline, JobOptions, PipelineOutcome};
pub use qc::QcResult;
