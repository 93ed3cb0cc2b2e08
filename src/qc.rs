//! Quality-control verdict
//!
//! Threshold policy and confidence score over the metrics bundle. Warnings
//! are additive; the orchestrator appends its own flags (`POINTCLOUD_SPARSE`,
//! `FIT_TIMEOUT`, `UNIT_SUSPECT`) before the verdict is finalized.

use serde::{Deserialize, Serialize};

use crate::config::FitConfig;
use crate::metrics::FitMetrics;

pub const WARN_HIGH_SURFACE_ERROR: &str = "HIGH_SURFACE_ERROR";
pub const WARN_HIGH_NOSE_ERROR: &str = "HIGH_NOSE_ERROR";
pub const WARN_LANDMARK_MISMATCH: &str = "LANDMARK_MISMATCH";
pub const WARN_HIGH_OUTLIER_RATIO: &str = "HIGH_OUTLIER_RATIO";
pub const WARN_POINTCLOUD_SPARSE: &str = "POINTCLOUD_SPARSE";
pub const WARN_FIT_TIMEOUT: &str = "FIT_TIMEOUT";

const OUTLIER_RATIO_WARN: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcResult {
    pub pass_fit: bool,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

/// Evaluate the QC policy over `metrics`.
///
/// `extra_warnings` come from earlier pipeline stages; `POINTCLOUD_SPARSE`
/// and `FIT_TIMEOUT` among them force a failing verdict.
pub fn build_qc(metrics: &FitMetrics, config: &FitConfig, extra_warnings: &[String]) -> QcResult {
    let mut warnings: Vec<String> = Vec::new();
    let mut pass_fit = true;

    if metrics.p95_mm > config.max_surface_mm_p95 {
        warnings.push(WARN_HIGH_SURFACE_ERROR.to_string());
        pass_fit = false;
    }
    if metrics.nose_p95_mm > config.max_nose_mm_p95 {
        warnings.push(WARN_HIGH_NOSE_ERROR.to_string());
        pass_fit = false;
    }
    if metrics.landmark_rms_mm > config.max_landmark_mm {
        warnings.push(WARN_LANDMARK_MISMATCH.to_string());
        pass_fit = false;
    }
    if metrics.outlier_ratio > OUTLIER_RATIO_WARN {
        warnings.push(WARN_HIGH_OUTLIER_RATIO.to_string());
    }

    for warning in extra_warnings {
        if !warnings.contains(warning) {
            warnings.push(warning.clone());
        }
        if warning == WARN_POINTCLOUD_SPARSE || warning == WARN_FIT_TIMEOUT {
            pass_fit = false;
        }
    }

    let mut confidence = 1.0;
    confidence -= (metrics.p95_mm / (config.max_surface_mm_p95 * 2.0)).min(0.5);
    confidence -= (metrics.nose_p95_mm / (config.max_nose_mm_p95 * 2.0)).min(0.3);
    confidence -= (metrics.landmark_rms_mm / (config.max_landmark_mm * 2.0)).min(0.2);
    let confidence = confidence.clamp(0.0, 1.0);

    QcResult {
        pass_fit,
        confidence,
        warnings,
    }
}
