//! Configuration Management
//!
//! Load fitting, deformation, overlay and pipeline options from a TOML file
//! or fall back to the built-in defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Complete job configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fit: FitConfig,
    #[serde(default)]
    pub nonrigid: NonRigidConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Model-space fitter configuration: per-stage step caps, composite loss
/// weights, robust-loss and region-weight controls, QC thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    #[serde(default = "default_iters_pose")]
    pub iters_pose: usize,
    #[serde(default = "default_iters_expr")]
    pub iters_expr: usize,
    #[serde(default = "default_iters_shape")]
    pub iters_shape: usize,

    #[serde(default = "default_w_landmark")]
    pub w_landmark: f32,
    #[serde(default = "default_w_chamfer")]
    pub w_chamfer: f32,
    #[serde(default = "default_w_point2plane")]
    pub w_point2plane: f32,
    #[serde(default = "default_w_prior_shape")]
    pub w_prior_shape: f32,
    #[serde(default = "default_w_prior_shape")]
    pub w_prior_expr: f32,
    #[serde(default = "default_w_prior_jaw")]
    pub w_prior_jaw: f32,

    /// Robust loss knee, meters.
    #[serde(default = "default_huber_delta")]
    pub huber_delta: f32,

    #[serde(default = "default_w_nose_multiplier")]
    pub w_nose_multiplier: f32,
    #[serde(default = "default_nose_radius_mm")]
    pub nose_radius_mm: f32,
    #[serde(default = "default_w_mouth_multiplier")]
    pub w_mouth_multiplier: f32,
    #[serde(default = "default_jaw_max_rad")]
    pub jaw_max_rad: f32,

    /// Source-side distance quantile above which correspondences are dropped.
    /// `None` disables trimming.
    #[serde(default = "default_trim_percentile")]
    pub trim_percentile: Option<f32>,

    #[serde(default = "default_max_landmark_mm")]
    pub max_landmark_mm: f64,
    #[serde(default = "default_max_surface_mm_p95")]
    pub max_surface_mm_p95: f64,
    #[serde(default = "default_max_nose_mm_p95")]
    pub max_nose_mm_p95: f64,
}

/// Non-rigid deformation controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonRigidConfig {
    #[serde(default = "default_nr_max_iterations")]
    pub max_iterations: usize,

    /// Laplacian regularization weight; higher preserves the template shape.
    #[serde(default = "default_nr_stiffness")]
    pub stiffness: f64,

    /// Diagonal weight applied to pinned landmark vertices.
    #[serde(default = "default_nr_landmark_weight")]
    pub landmark_weight: f64,

    /// RMS vertex-change threshold, meters.
    #[serde(default = "default_nr_convergence_threshold")]
    pub convergence_threshold: f64,

    /// Correspondences farther than this are masked out, meters.
    #[serde(default = "default_nr_max_correspondence_distance")]
    pub max_correspondence_distance: f64,
}

/// Binary overlay pack controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_overlay_knn_k")]
    pub knn_k: usize,
    #[serde(default = "default_overlay_max_dist_m")]
    pub max_dist_m: f32,
    #[serde(default = "default_overlay_voxel_size")]
    pub voxel_size: f32,
    #[serde(default = "default_overlay_max_points")]
    pub max_points: usize,
    #[serde(default = "default_overlay_min_points")]
    pub min_points: usize,
    #[serde(default = "default_overlay_epsilon")]
    pub epsilon: f32,
    #[serde(default = "default_overlay_version")]
    pub version: String,
}

/// Orchestration controls: preprocessing, sparse fallback, refit triggers,
/// wall-clock budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Voxel size for the fitting down-sample, meters.
    #[serde(default = "default_voxel_size")]
    pub voxel_size: f32,
    #[serde(default = "default_normal_radius")]
    pub normal_radius: f32,
    #[serde(default = "default_normal_max_nn")]
    pub normal_max_nn: usize,
    #[serde(default = "default_outlier_neighbors")]
    pub outlier_neighbors: usize,
    #[serde(default = "default_outlier_std_ratio")]
    pub outlier_std_ratio: f32,

    /// Caller-side cap on the fitting cloud size.
    #[serde(default = "default_fit_point_cap")]
    pub fit_point_cap: usize,

    /// Below this many down-sampled points the expression and shape stages
    /// are disabled.
    #[serde(default = "default_sparse_threshold")]
    pub sparse_threshold: usize,
    /// Below this many down-sampled points the job fails.
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Non-rigid refinement is skipped when the model-space p95 is at or
    /// above this, millimeters.
    #[serde(default = "default_nonrigid_skip_p95_mm")]
    pub nonrigid_skip_p95_mm: f64,
    /// Non-rigid output is discarded when not converged and mean error is at
    /// or above this, millimeters.
    #[serde(default = "default_nonrigid_accept_mean_mm")]
    pub nonrigid_accept_mean_mm: f64,

    #[serde(default = "default_refit_outlier_ratio")]
    pub refit_outlier_ratio: f64,
    #[serde(default = "default_refit_landmark_rms_mm")]
    pub refit_landmark_rms_mm: f64,
    #[serde(default = "default_refit_p95_mm")]
    pub refit_p95_mm: f64,
    /// Radius for the landmark-based refit crop, meters.
    #[serde(default = "default_refit_crop_dist_m")]
    pub refit_crop_dist_m: f32,

    #[serde(default = "default_max_seconds")]
    pub max_seconds: f64,
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }
}

// Default value functions
fn default_iters_pose() -> usize { 80 }
fn default_iters_expr() -> usize { 120 }
fn default_iters_shape() -> usize { 160 }
fn default_w_landmark() -> f32 { 2.0 }
fn default_w_chamfer() -> f32 { 1.0 }
fn default_w_point2plane() -> f32 { 0.5 }
fn default_w_prior_shape() -> f32 { 0.005 }
fn default_w_prior_jaw() -> f32 { 0.02 }
fn default_huber_delta() -> f32 { 0.01 }
fn default_w_nose_multiplier() -> f32 { 3.0 }
fn default_nose_radius_mm() -> f32 { 30.0 }
fn default_w_mouth_multiplier() -> f32 { 2.5 }
fn default_jaw_max_rad() -> f32 { 0.35 }
fn default_trim_percentile() -> Option<f32> { Some(0.98) }
fn default_max_landmark_mm() -> f64 { 4.0 }
fn default_max_surface_mm_p95() -> f64 { 6.0 }
fn default_max_nose_mm_p95() -> f64 { 4.0 }

fn default_nr_max_iterations() -> usize { 80 }
fn default_nr_stiffness() -> f64 { 5.0 }
fn default_nr_landmark_weight() -> f64 { 50.0 }
fn default_nr_convergence_threshold() -> f64 { 1e-5 }
fn default_nr_max_correspondence_distance() -> f64 { 0.03 }

fn default_overlay_knn_k() -> usize { 4 }
fn default_overlay_max_dist_m() -> f32 { 0.05 }
fn default_overlay_voxel_size() -> f32 { 0.004 }
fn default_overlay_max_points() -> usize { 80_000 }
fn default_overlay_min_points() -> usize { 3_000 }
fn default_overlay_epsilon() -> f32 { 1e-6 }
fn default_overlay_version() -> String { "v1".to_string() }

fn default_voxel_size() -> f32 { 0.005 }
fn default_normal_radius() -> f32 { 0.02 }
fn default_normal_max_nn() -> usize { 30 }
fn default_outlier_neighbors() -> usize { 20 }
fn default_outlier_std_ratio() -> f32 { 2.0 }
fn default_fit_point_cap() -> usize { 2_000 }
fn default_sparse_threshold() -> usize { 500 }
fn default_min_points() -> usize { 200 }
fn default_nonrigid_skip_p95_mm() -> f64 { 20.0 }
fn default_nonrigid_accept_mean_mm() -> f64 { 10.0 }
fn default_refit_outlier_ratio() -> f64 { 0.5 }
fn default_refit_landmark_rms_mm() -> f64 { 10.0 }
fn default_refit_p95_mm() -> f64 { 25.0 }
fn default_refit_crop_dist_m() -> f32 { 0.05 }
fn default_max_seconds() -> f64 { 20.0 }
fn default_max_iters() -> usize { 360 }
fn default_seed() -> u64 { 42 }
fn default_true() -> bool { true }

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            iters_pose: default_iters_pose(),
            iters_expr: default_iters_expr(),
            iters_shape: default_iters_shape(),
            w_landmark: default_w_landmark(),
            w_chamfer: default_w_chamfer(),
            w_point2plane: default_w_point2plane(),
            w_prior_shape: default_w_prior_shape(),
            w_prior_expr: default_w_prior_shape(),
            w_prior_jaw: default_w_prior_jaw(),
            huber_delta: default_huber_delta(),
            w_nose_multiplier: default_w_nose_multiplier(),
            nose_radius_mm: default_nose_radius_mm(),
            w_mouth_multiplier: default_w_mouth_multiplier(),
            jaw_max_rad: default_jaw_max_rad(),
            trim_percentile: default_trim_percentile(),
            max_landmark_mm: default_max_landmark_mm(),
            max_surface_mm_p95: default_max_surface_mm_p95(),
            max_nose_mm_p95: default_max_nose_mm_p95(),
        }
    }
}

impl Default for NonRigidConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_nr_max_iterations(),
            stiffness: default_nr_stiffness(),
            landmark_weight: default_nr_landmark_weight(),
            convergence_threshold: default_nr_convergence_threshold(),
            max_correspondence_distance: default_nr_max_correspondence_distance(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            knn_k: default_overlay_knn_k(),
            max_dist_m: default_overlay_max_dist_m(),
            voxel_size: default_overlay_voxel_size(),
            max_points: default_overlay_max_points(),
            min_points: default_overlay_min_points(),
            epsilon: default_overlay_epsilon(),
            version: default_overlay_version(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            voxel_size: default_voxel_size(),
            normal_radius: default_normal_radius(),
            normal_max_nn: default_normal_max_nn(),
            outlier_neighbors: default_outlier_neighbors(),
            outlier_std_ratio: default_outlier_std_ratio(),
            fit_point_cap: default_fit_point_cap(),
            sparse_threshold: default_sparse_threshold(),
            min_points: default_min_points(),
            nonrigid_skip_p95_mm: default_nonrigid_skip_p95_mm(),
            nonrigid_accept_mean_mm: default_nonrigid_accept_mean_mm(),
            refit_outlier_ratio: default_refit_outlier_ratio(),
            refit_landmark_rms_mm: default_refit_landmark_rms_mm(),
            refit_p95_mm: default_refit_p95_mm(),
            refit_crop_dist_m: default_refit_crop_dist_m(),
            max_seconds: default_max_seconds(),
            max_iters: default_max_iters(),
            seed: default_seed(),
        }
    }
}
