//! Pipeline orchestrator
//!
//! Linear staging from a raw cloud to the QC'd result:
//! `read → units → crop → preprocess → fit → [refit] → nonrigid_deform →
//! metrics → export`. Stage flags (`sparse_mode`, `timeout`) short-circuit
//! later stages; every downgrade is recorded, never silent.

pub mod crop;
pub mod repeatability;

pub use crop::crop_face_region;
pub use repeatability::repeatability_check;

use std::path::Path;

use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{FaceForgeError, Result};
use crate::fitter::{FitOptions, FlameParams, ModelFit, ModelFitter, StageRecord};
use crate::geometry::{remove_statistical_outliers, voxel_downsample, PointCloud};
use crate::io;
use crate::job::{CancelToken, JobBudget};
use crate::landmarks::{LandmarkEmbedding, NOSE_TIP_INDEX};
use crate::metrics::{
    landmark_rms_mm, nose_error_p95_mm, surface_error_metrics, FitMetrics, SurfaceMetrics,
};
use crate::model::FlameModel;
use crate::nonrigid::{deform_to_scan, NonRigidResult};
use crate::qc::{build_qc, QcResult, WARN_FIT_TIMEOUT, WARN_POINTCLOUD_SPARSE};
use crate::units::{normalize_units, UnitLabel};

/// Stable identifier recorded with the nose metric; bump when the nose
/// aggregation semantics change.
const NOSE_DEFINITION_VERSION: &str = "v1";

/// Pipeline stage labels used for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Units,
    Crop,
    Preprocess,
    Fit,
    Refit,
    NonrigidDeform,
    Metrics,
    Export,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Units => "units",
            Stage::Crop => "crop",
            Stage::Preprocess => "preprocess",
            Stage::Fit => "fit",
            Stage::Refit => "refit",
            Stage::NonrigidDeform => "nonrigid_deform",
            Stage::Metrics => "metrics",
            Stage::Export => "export",
        }
    }
}

/// Per-job options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub override_scale: Option<f32>,
    pub override_units: Option<UnitLabel>,
    /// Warm-start identity coefficients from an external provider.
    pub initial_shape: Option<Vec<f32>>,
    pub cancel: CancelToken,
}

/// Non-rigid refinement summary kept in the diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonRigidSummary {
    pub mean_mm: f64,
    pub p95_mm: f64,
    pub max_mm: f64,
    pub iterations_used: usize,
    pub converged: bool,
    /// True when the deformed mesh superseded the model-space mesh.
    pub applied: bool,
}

/// Versioned diagnostics bundle.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics<'a> {
    pub version: &'static str,
    pub flame_params: &'a FlameParams,
    pub stage_results: &'a [StageRecord],
    pub metrics: &'a FitMetrics,
    pub qc: &'a QcResult,
    pub sparse_mode: bool,
    pub timed_out: bool,
    pub refit_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonrigid: Option<&'a NonRigidSummary>,
    pub stages: Vec<&'static str>,
}

/// The complete result of one job.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub mesh_vertices: Vec<Point3<f32>>,
    pub landmarks: Vec<Point3<f32>>,
    pub params: FlameParams,
    pub stage_records: Vec<StageRecord>,
    pub metrics: FitMetrics,
    pub qc: QcResult,
    /// Per-vertex displacement field when the non-rigid result was adopted.
    pub displacements: Option<Vec<Vector3<f32>>>,
    pub nonrigid: Option<NonRigidSummary>,
    pub sparse_mode: bool,
    pub timed_out: bool,
    pub refit_applied: bool,
    pub stage_trace: Vec<&'static str>,
    /// Unit-normalized cloud kept for the overlay pack.
    pub normalized_cloud: PointCloud,
}

impl PipelineOutcome {
    pub fn diagnostics(&self) -> Diagnostics<'_> {
        Diagnostics {
            version: "1",
            flame_params: &self.params,
            stage_results: &self.stage_records,
            metrics: &self.metrics,
            qc: &self.qc,
            sparse_mode: self.sparse_mode,
            timed_out: self.timed_out,
            refit_applied: self.refit_applied,
            nonrigid: self.nonrigid.as_ref(),
            stages: self.stage_trace.clone(),
        }
    }
}

/// One fitted-mesh candidate during refit adoption.
struct Candidate {
    fit: ModelFit,
    surface: SurfaceMetrics,
    source: &'static str,
}

/// The pipeline over a loaded model, embedding and configuration. Owns no
/// job state: each `run` call is independent and jobs may execute
/// concurrently on the same shared pipeline.
pub struct FitPipeline<'a> {
    model: &'a FlameModel,
    embedding: &'a LandmarkEmbedding,
    config: &'a Config,
}

impl<'a> FitPipeline<'a> {
    pub fn new(
        model: &'a FlameModel,
        embedding: &'a LandmarkEmbedding,
        config: &'a Config,
    ) -> Self {
        Self {
            model,
            embedding,
            config,
        }
    }

    /// Run the full pipeline on `cloud`.
    pub fn run(&self, cloud: PointCloud, options: &JobOptions) -> Result<PipelineOutcome> {
        let pipeline_cfg = &self.config.pipeline;
        let budget = JobBudget::new(pipeline_cfg.max_seconds);
        let cancel = &options.cancel;
        let mut trace: Vec<&'static str> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // read
        trace.push(Stage::Read.as_str());
        if cloud.is_empty() {
            return Err(FaceForgeError::EmptyInput("point cloud"));
        }
        cloud.validate_finite()?;

        // units
        trace.push(Stage::Units.as_str());
        let unit = normalize_units(cloud, options.override_scale, options.override_units);
        warnings.extend(unit.warnings.iter().cloned());
        let normalized = unit.cloud;
        if normalized.bbox_diagonal() <= f32::EPSILON {
            return Err(FaceForgeError::DegenerateGeometry(
                "bounding box collapsed after unit scaling".to_string(),
            ));
        }

        // crop
        trace.push(Stage::Crop.as_str());
        let cropped = crop_face_region(&normalized);

        // preprocess
        trace.push(Stage::Preprocess.as_str());
        let (fit_cloud, normals, sparse_mode) = self.preprocess(&cropped)?;
        if sparse_mode {
            warnings.push(WARN_POINTCLOUD_SPARSE.to_string());
        }

        // fit
        trace.push(Stage::Fit.as_str());
        let fitter = ModelFitter::new(self.model, self.embedding, &self.config.fit);
        let fit_options = FitOptions {
            sparse_mode,
            initial_shape: options.initial_shape.clone(),
            max_iters: pipeline_cfg.max_iters,
            ..FitOptions::default()
        };
        let fit = fitter.fit(&fit_cloud.points, &normals, &fit_options, &budget, cancel)?;
        let surface = surface_error_metrics(&fit.vertices, &fit_cloud.points)?;
        let lmk_rms = landmark_rms_mm(&fit.landmarks, &fit_cloud.points)?;

        let mut timed_out = fit.timed_out;
        let mut stage_records = fit.stages.clone();
        let mut refit_applied = false;
        let mut current = Candidate {
            fit,
            surface,
            source: "fit",
        };

        // refit (conditional)
        let needs_refit = !timed_out
            && (current.surface.outlier_ratio > pipeline_cfg.refit_outlier_ratio
                || lmk_rms > pipeline_cfg.refit_landmark_rms_mm
                || current.surface.p95_mm > pipeline_cfg.refit_p95_mm);
        if needs_refit {
            trace.push(Stage::Refit.as_str());
            if let Some(candidate) = self.refit(
                &fitter,
                &fit_cloud,
                &normals,
                &fit_options,
                &budget,
                cancel,
                &mut stage_records,
            )? {
                timed_out |= candidate.fit.timed_out;
                if candidate.surface.p95_mm < current.surface.p95_mm {
                    info!(
                        source = candidate.source,
                        p95_before = current.surface.p95_mm,
                        p95_after = candidate.surface.p95_mm,
                        "refit adopted"
                    );
                    refit_applied = true;
                    current = candidate;
                } else {
                    info!(
                        p95_refit = candidate.surface.p95_mm,
                        p95_original = current.surface.p95_mm,
                        "refit discarded"
                    );
                }
            }
        }

        // nonrigid_deform (conditional)
        let mut mesh_vertices = current.fit.vertices.clone();
        let mut landmarks = current.fit.landmarks.clone();
        let mut surface = current.surface;
        let mut displacements = None;
        let mut nonrigid_summary = None;

        let skip_nonrigid =
            sparse_mode || timed_out || surface.p95_mm >= pipeline_cfg.nonrigid_skip_p95_mm;
        if skip_nonrigid {
            info!(
                sparse_mode,
                timed_out,
                p95_mm = surface.p95_mm,
                "non-rigid refinement skipped"
            );
        } else {
            trace.push(Stage::NonrigidDeform.as_str());
            let result = deform_to_scan(
                &mesh_vertices,
                self.model.faces(),
                &fit_cloud.points,
                &[],
                &self.config.nonrigid,
                &budget,
                cancel,
            )?;
            let accepted = result.converged
                || result.mean_error * 1000.0 < pipeline_cfg.nonrigid_accept_mean_mm;
            let mut applied = false;
            if accepted {
                let deformed_surface =
                    surface_error_metrics(&result.deformed_vertices, &fit_cloud.points)?;
                if deformed_surface.p95_mm < surface.p95_mm {
                    applied = true;
                    surface = deformed_surface;
                    landmarks = self.embedding.evaluate(&result.deformed_vertices);
                    mesh_vertices = result.deformed_vertices.clone();
                    displacements = Some(result.displacements.clone());
                }
            } else {
                warn!(
                    mean_mm = result.mean_error * 1000.0,
                    converged = result.converged,
                    "non-rigid result discarded"
                );
            }
            nonrigid_summary = Some(summarize_nonrigid(&result, applied));
        }

        // metrics
        trace.push(Stage::Metrics.as_str());
        let landmark_rms = landmark_rms_mm(&landmarks, &fit_cloud.points)?;
        let nose_idx = NOSE_TIP_INDEX.min(landmarks.len().saturating_sub(1));
        let nose_p95 = nose_error_p95_mm(&landmarks, &fit_cloud.points, nose_idx)?;
        let metrics = FitMetrics {
            mean_mm: surface.mean_mm,
            median_mm: surface.median_mm,
            p95_mm: surface.p95_mm,
            nose_p95_mm: nose_p95,
            landmark_rms_mm: landmark_rms,
            outlier_ratio: surface.outlier_ratio,
            units_inferred: Some(unit.units_inferred.as_str().to_string()),
            unit_scale_applied: Some(unit.unit_scale_applied),
            repeatability_std_mm: None,
            nose_definition_version: Some(NOSE_DEFINITION_VERSION.to_string()),
        };

        if timed_out {
            warnings.push(WARN_FIT_TIMEOUT.to_string());
        }
        let qc = build_qc(&metrics, &self.config.fit, &warnings);
        info!(
            pass_fit = qc.pass_fit,
            confidence = qc.confidence,
            p95_mm = metrics.p95_mm,
            "pipeline finished"
        );

        Ok(PipelineOutcome {
            mesh_vertices,
            landmarks,
            params: current.fit.params,
            stage_records,
            metrics,
            qc,
            displacements,
            nonrigid: nonrigid_summary,
            sparse_mode,
            timed_out,
            refit_applied,
            stage_trace: trace,
            normalized_cloud: normalized,
        })
    }

    /// Down-sample, de-noise, cap and re-estimate normals for the fitting
    /// cloud. Returns `(cloud, normals, sparse_mode)`.
    fn preprocess(&self, cropped: &PointCloud) -> Result<(PointCloud, Vec<Vector3<f32>>, bool)> {
        let cfg = &self.config.pipeline;

        let mut fit_cloud = voxel_downsample(cropped, cfg.voxel_size);
        let down_count = fit_cloud.len();
        if down_count < cfg.min_points {
            return Err(FaceForgeError::PointCloudTooSparse {
                points: down_count,
                minimum: cfg.min_points,
            });
        }
        let sparse_mode = down_count < cfg.sparse_threshold;

        let (filtered, _) =
            remove_statistical_outliers(&fit_cloud, cfg.outlier_neighbors, cfg.outlier_std_ratio)?;
        fit_cloud = filtered;
        if fit_cloud.len() < cfg.min_points {
            return Err(FaceForgeError::PointCloudTooSparse {
                points: fit_cloud.len(),
                minimum: cfg.min_points,
            });
        }

        if fit_cloud.len() > cfg.fit_point_cap {
            let mut rng = StdRng::seed_from_u64(cfg.seed);
            let mut picked =
                rand::seq::index::sample(&mut rng, fit_cloud.len(), cfg.fit_point_cap).into_vec();
            picked.sort_unstable();
            fit_cloud = fit_cloud.select(&picked);
        }

        let estimate = crate::geometry::estimate_normals(
            &fit_cloud.points,
            cfg.normal_radius,
            cfg.normal_max_nn,
        )?;
        if estimate.degenerate_count > 0 {
            warn!(
                degenerate = estimate.degenerate_count,
                "degenerate normal neighborhoods in fitting cloud"
            );
        }

        info!(
            input = cropped.len(),
            fitting = fit_cloud.len(),
            sparse_mode,
            "preprocess"
        );
        Ok((fit_cloud, estimate.normals, sparse_mode))
    }

    /// Second fit with frozen expression and jaw, plus a landmark-crop
    /// variant. The crop result wins only when its p95 is strictly lower
    /// than the plain refit's.
    #[allow(clippy::too_many_arguments)]
    fn refit(
        &self,
        fitter: &ModelFitter<'_>,
        fit_cloud: &PointCloud,
        normals: &[Vector3<f32>],
        base_options: &FitOptions,
        budget: &JobBudget,
        cancel: &CancelToken,
        stage_records: &mut Vec<StageRecord>,
    ) -> Result<Option<Candidate>> {
        let frozen = FitOptions {
            freeze_expression: true,
            freeze_jaw: true,
            ..base_options.clone()
        };

        let refit = fitter.fit(&fit_cloud.points, normals, &frozen, budget, cancel)?;
        push_prefixed_records(stage_records, &refit.stages, "refit_");
        let refit_surface = surface_error_metrics(&refit.vertices, &fit_cloud.points)?;
        let mut best = Candidate {
            fit: refit,
            surface: refit_surface,
            source: "refit",
        };

        // Landmark-based crop: retry against only the cloud points near the
        // refit surface.
        if let Some((crop_cloud, crop_normals)) =
            self.crop_to_mesh(fit_cloud, normals, &best.fit.vertices)
        {
            let crop_fit = fitter.fit(&crop_cloud.points, &crop_normals, &frozen, budget, cancel)?;
            push_prefixed_records(stage_records, &crop_fit.stages, "refit_crop_");
            // Candidates compare against the full fitting cloud so the crop
            // cannot win by shrinking its own yardstick.
            let crop_surface = surface_error_metrics(&crop_fit.vertices, &fit_cloud.points)?;
            if crop_surface.p95_mm < best.surface.p95_mm {
                best = Candidate {
                    fit: crop_fit,
                    surface: crop_surface,
                    source: "refit_crop",
                };
            }
        }

        Ok(Some(best))
    }

    /// Keep cloud points within the refit-crop radius of the mesh; `None`
    /// when the crop would be useless (too few points or no reduction).
    fn crop_to_mesh(
        &self,
        fit_cloud: &PointCloud,
        normals: &[Vector3<f32>],
        vertices: &[Point3<f32>],
    ) -> Option<(PointCloud, Vec<Vector3<f32>>)> {
        let max_dist = self.config.pipeline.refit_crop_dist_m;
        let tree = crate::geometry::KdTree::build(vertices).ok()?;
        let kept: Vec<usize> = tree
            .nearest_batch(&fit_cloud.points)
            .iter()
            .enumerate()
            .filter(|&(_, &(_, d_sq))| d_sq <= max_dist * max_dist)
            .map(|(i, _)| i)
            .collect();

        let keep_ratio = kept.len() as f64 / fit_cloud.len() as f64;
        if kept.len() < self.config.pipeline.min_points || keep_ratio < 0.2 {
            return None;
        }
        if kept.len() == fit_cloud.len() {
            return None;
        }
        let cropped = fit_cloud.select(&kept);
        let cropped_normals = kept.iter().map(|&i| normals[i]).collect();
        Some((cropped, cropped_normals))
    }

    /// Write the job artifacts: GLB mesh, landmark JSON, diagnostics JSON
    /// and (when enabled) the binary overlay pack.
    pub fn export(&self, outcome: &PipelineOutcome, out_dir: &Path, scan_id: &str) -> Result<()> {
        std::fs::create_dir_all(out_dir)?;
        info!(stage = Stage::Export.as_str(), scan_id, "exporting artifacts");

        io::write_glb(
            out_dir.join(format!("{}_model.glb", scan_id)),
            &outcome.mesh_vertices,
            self.model.faces(),
        )?;
        io::write_landmarks_json(
            out_dir.join(format!("{}_landmarks.json", scan_id)),
            &outcome.landmarks,
        )?;
        io::write_json_pretty(
            out_dir.join(format!("{}_diagnostics.json", scan_id)),
            &outcome.diagnostics(),
        )?;

        if self.config.overlay.enabled {
            let pack = io::build_overlay_pack(
                &outcome.normalized_cloud,
                &outcome.mesh_vertices,
                &self.config.overlay,
                self.config.pipeline.seed,
            )?;
            io::write_overlay_pack(out_dir, scan_id, &pack)?;
        }
        Ok(())
    }
}

fn summarize_nonrigid(result: &NonRigidResult, applied: bool) -> NonRigidSummary {
    NonRigidSummary {
        mean_mm: result.mean_error * 1000.0,
        p95_mm: result.p95_error * 1000.0,
        max_mm: result.max_error * 1000.0,
        iterations_used: result.iterations_used,
        converged: result.converged,
        applied,
    }
}

fn push_prefixed_records(records: &mut Vec<StageRecord>, stages: &[StageRecord], prefix: &str) {
    for stage in stages {
        let mut renamed = stage.clone();
        renamed.name = format!("{}{}", prefix, stage.name);
        records.push(renamed);
    }
}
