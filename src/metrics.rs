//! Fitting metrics
//!
//! Surface, landmark and nose error statistics between a fitted mesh and the
//! scan cloud. All computation is in meters; reported values are millimeters.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::KdTree;

/// Distance above which a vertex counts as an outlier, meters (5 mm).
pub const OUTLIER_DISTANCE_M: f64 = 0.005;

/// Surface error statistics in millimeters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SurfaceMetrics {
    pub mean_mm: f64,
    pub median_mm: f64,
    pub p95_mm: f64,
    pub outlier_ratio: f64,
}

/// The full metrics bundle attached to a fit result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitMetrics {
    pub mean_mm: f64,
    pub median_mm: f64,
    pub p95_mm: f64,
    pub nose_p95_mm: f64,
    pub landmark_rms_mm: f64,
    pub outlier_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units_inferred: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_scale_applied: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeatability_std_mm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nose_definition_version: Option<String>,
}

/// Linear-interpolation percentile, matching the numpy default.
///
/// `pct` is in `[0, 100]`. Empty input yields infinity.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

/// Nearest-neighbor distance from every `source` point to `target`.
pub fn nearest_distances(source: &[Point3<f32>], target: &[Point3<f32>]) -> Result<Vec<f64>> {
    let tree = KdTree::build(target)?;
    Ok(tree
        .nearest_batch(source)
        .into_iter()
        .map(|(_, d_sq)| (d_sq as f64).max(0.0).sqrt())
        .collect())
}

/// Mesh-to-cloud surface statistics.
pub fn surface_error_metrics(
    mesh_vertices: &[Point3<f32>],
    cloud_points: &[Point3<f32>],
) -> Result<SurfaceMetrics> {
    let distances = nearest_distances(mesh_vertices, cloud_points)?;
    let n = distances.len() as f64;
    let mean = distances.iter().sum::<f64>() / n;
    let outliers = distances.iter().filter(|&&d| d > OUTLIER_DISTANCE_M).count();

    Ok(SurfaceMetrics {
        mean_mm: mean * 1000.0,
        median_mm: percentile(&distances, 50.0) * 1000.0,
        p95_mm: percentile(&distances, 95.0) * 1000.0,
        outlier_ratio: outliers as f64 / n,
    })
}

/// Root-mean-square landmark-to-cloud distance, millimeters.
pub fn landmark_rms_mm(landmarks: &[Point3<f32>], cloud_points: &[Point3<f32>]) -> Result<f64> {
    let distances = nearest_distances(landmarks, cloud_points)?;
    let mean_sq = distances.iter().map(|d| d * d).sum::<f64>() / distances.len() as f64;
    Ok(mean_sq.sqrt() * 1000.0)
}

/// Nose-tip error, millimeters.
///
/// Only the nose-tip landmark is queried, so the p95 of the single-element
/// distance set reduces to that one distance. Kept as a percentile for schema
/// uniformity; do not change the aggregation without versioning
/// `nose_definition_version`.
pub fn nose_error_p95_mm(
    landmarks: &[Point3<f32>],
    cloud_points: &[Point3<f32>],
    nose_tip_idx: usize,
) -> Result<f64> {
    let nose = &landmarks[nose_tip_idx..nose_tip_idx + 1];
    let distances = nearest_distances(nose, cloud_points)?;
    Ok(percentile(&distances, 95.0) * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates_linearly() {
        let values = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 50.0), 2.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert!((percentile(&values, 95.0) - 3.8).abs() < 1e-12);
    }

    #[test]
    fn percentile_of_empty_is_infinite() {
        assert!(percentile(&[], 95.0).is_infinite());
    }

    #[test]
    fn zero_distance_for_identical_sets() {
        let points: Vec<Point3<f32>> = (0..50)
            .map(|i| Point3::new(i as f32 * 0.01, 0.0, 0.0))
            .collect();
        let metrics = surface_error_metrics(&points, &points).unwrap();
        assert_eq!(metrics.mean_mm, 0.0);
        assert_eq!(metrics.p95_mm, 0.0);
        assert_eq!(metrics.outlier_ratio, 0.0);
    }

    #[test]
    fn outlier_ratio_counts_far_vertices() {
        let cloud: Vec<Point3<f32>> = (0..10)
            .map(|i| Point3::new(i as f32 * 0.01, 0.0, 0.0))
            .collect();
        // Two of four vertices sit 10 mm off the cloud.
        let mesh = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.05, 0.0, 0.0),
            Point3::new(0.0, 0.01, 0.0),
            Point3::new(0.05, 0.01, 0.0),
        ];
        let metrics = surface_error_metrics(&mesh, &cloud).unwrap();
        assert!((metrics.outlier_ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn nose_metric_uses_single_landmark() {
        let cloud = vec![Point3::new(0.0, 0.0, 0.0)];
        let landmarks = vec![Point3::new(1.0, 0.0, 0.0), Point3::new(0.003, 0.0, 0.0)];
        let nose = nose_error_p95_mm(&landmarks, &cloud, 1).unwrap();
        assert!((nose - 3.0).abs() < 1e-9);
    }
}
