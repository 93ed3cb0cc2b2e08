//! Rigid ICP
//!
//! Point-to-point iterative closest point. Correspondences are gated by a
//! maximum distance; the per-iteration rigid update is the SVD-based
//! Procrustes solution. Convergence follows the usual criteria: iteration
//! cap, or relative fitness/RMSE improvement below 1e-6.

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::debug;

use super::KdTree;
use crate::error::{FaceForgeError, Result};

const RELATIVE_TOLERANCE: f64 = 1e-6;

/// Result of a rigid alignment: `p_target ≈ R * p_source + t`.
#[derive(Debug, Clone)]
pub struct IcpResult {
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
    /// Fraction of source points with a valid correspondence.
    pub fitness: f32,
    /// RMS distance over valid correspondences.
    pub inlier_rmse: f32,
    pub iterations: usize,
}

impl IcpResult {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            fitness: 0.0,
            inlier_rmse: 0.0,
            iterations: 0,
        }
    }

    pub fn apply(&self, p: &Point3<f32>) -> Point3<f32> {
        Point3::from(self.rotation * p.coords + self.translation)
    }
}

/// Align `source` onto `target`.
///
/// Each iteration matches every source point to its nearest target within
/// `max_dist`; unmatched points are dropped for that iteration. Fewer than
/// three matches leaves the current estimate in place.
pub fn icp_rigid(
    source: &[Point3<f32>],
    target: &[Point3<f32>],
    max_dist: f32,
    max_iter: usize,
) -> Result<IcpResult> {
    if source.is_empty() {
        return Err(FaceForgeError::EmptyInput("icp source"));
    }
    let tree = KdTree::build(target)?;
    let max_dist_sq = max_dist * max_dist;

    let mut result = IcpResult::identity();
    let mut transformed: Vec<Point3<f32>> = source.to_vec();
    let mut prev_fitness = 0.0f64;
    let mut prev_rmse = f64::INFINITY;

    for iteration in 0..max_iter {
        let matches = tree.nearest_batch(&transformed);

        let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(source.len());
        let mut sq_sum = 0.0f64;
        for (i, &(j, dist_sq)) in matches.iter().enumerate() {
            if dist_sq <= max_dist_sq {
                pairs.push((i, j));
                sq_sum += dist_sq as f64;
            }
        }

        if pairs.len() < 3 {
            debug!(iteration, matched = pairs.len(), "icp starved of matches");
            break;
        }

        let fitness = pairs.len() as f64 / source.len() as f64;
        let rmse = (sq_sum / pairs.len() as f64).sqrt();

        let (delta_r, delta_t) = procrustes(&transformed, target, &pairs);
        result.rotation = delta_r * result.rotation;
        result.translation = delta_r * result.translation + delta_t;
        for p in transformed.iter_mut() {
            *p = Point3::from(delta_r * p.coords + delta_t);
        }

        result.fitness = fitness as f32;
        result.inlier_rmse = rmse as f32;
        result.iterations = iteration + 1;

        let fitness_gain = (fitness - prev_fitness).abs() / fitness.max(f64::EPSILON);
        let rmse_gain = (prev_rmse - rmse).abs() / rmse.max(f64::EPSILON);
        if iteration > 0 && fitness_gain < RELATIVE_TOLERANCE && rmse_gain < RELATIVE_TOLERANCE {
            break;
        }
        prev_fitness = fitness;
        prev_rmse = rmse;
    }

    Ok(result)
}

/// SVD-based Procrustes: the rigid transform minimizing the squared residual
/// over the matched pairs.
fn procrustes(
    source: &[Point3<f32>],
    target: &[Point3<f32>],
    pairs: &[(usize, usize)],
) -> (Matrix3<f32>, Vector3<f32>) {
    let n = pairs.len() as f64;
    let mut centroid_s = Vector3::<f64>::zeros();
    let mut centroid_t = Vector3::<f64>::zeros();
    for &(i, j) in pairs {
        centroid_s += source[i].coords.cast::<f64>();
        centroid_t += target[j].coords.cast::<f64>();
    }
    centroid_s /= n;
    centroid_t /= n;

    let mut h = Matrix3::<f64>::zeros();
    for &(i, j) in pairs {
        let s = source[i].coords.cast::<f64>() - centroid_s;
        let t = target[j].coords.cast::<f64>() - centroid_t;
        h += s * t.transpose();
    }

    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return (Matrix3::identity(), Vector3::zeros()),
    };

    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut v = v_t.transpose();
        v.set_column(2, &(-v.column(2)));
        rotation = v * u.transpose();
    }

    let translation = centroid_t - rotation * centroid_s;
    (rotation.cast::<f32>(), translation.cast::<f32>())
}
