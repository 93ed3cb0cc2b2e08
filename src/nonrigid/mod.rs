//! Non-rigid mesh deformer
//!
//! Laplacian-regularized non-rigid ICP. The template keeps its topology and
//! semantic structure; each iteration pulls vertices toward their nearest
//! scan points under a smoothness term, solving one sparse SPD system per
//! coordinate. The displacement field `deformed - base` is what makes the
//! result morphable afterwards.

pub mod laplacian;
pub mod solver;

pub use laplacian::{build_laplacian, CsrMatrix};
pub use solver::solve_spd;

use itertools::izip;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::NonRigidConfig;
use crate::error::{FaceForgeError, Result};
use crate::geometry::KdTree;
use crate::job::{CancelToken, JobBudget};
use crate::metrics::percentile;

/// A vertex pinned to a target position during deformation.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkPin {
    pub vertex: usize,
    pub target: Point3<f32>,
}

/// Result of the deformation.
#[derive(Debug, Clone)]
pub struct NonRigidResult {
    /// Deformed vertex positions, same topology as the input template.
    pub deformed_vertices: Vec<Point3<f32>>,
    /// Per-vertex displacement from the rigidly aligned template.
    pub displacements: Vec<Vector3<f32>>,
    /// Per-vertex distance to the nearest scan point at exit.
    pub vertex_errors: Vec<f32>,
    pub mean_error: f64,
    pub max_error: f64,
    pub p95_error: f64,
    pub iterations_used: usize,
    pub converged: bool,
}

impl NonRigidResult {
    /// Blend the displacement field: 0 keeps the base mesh, 1 is the fully
    /// deformed surface.
    pub fn blended(&self, base: &[Point3<f32>], alpha: f32) -> Vec<Point3<f32>> {
        base.iter()
            .zip(&self.displacements)
            .map(|(p, d)| p + d * alpha)
            .collect()
    }
}

struct Correspondences {
    targets: Vec<Point3<f32>>,
    distances: Vec<f32>,
    valid: Vec<bool>,
}

/// Nearest scan point per vertex within `max_distance`. Vertices without a
/// match keep their own position as a placeholder target and are masked out.
fn find_correspondences(
    vertices: &[Point3<f32>],
    tree: &KdTree<'_>,
    target_points: &[Point3<f32>],
    max_distance: f64,
) -> Correspondences {
    let hits = tree.nearest_batch(vertices);
    let mut targets = Vec::with_capacity(vertices.len());
    let mut distances = Vec::with_capacity(vertices.len());
    let mut valid = Vec::with_capacity(vertices.len());
    for (vertex, &(idx, dist_sq)) in vertices.iter().zip(&hits) {
        let dist = dist_sq.max(0.0).sqrt();
        let ok = (dist as f64) <= max_distance;
        targets.push(if ok { target_points[idx] } else { *vertex });
        distances.push(dist);
        valid.push(ok);
    }
    Correspondences {
        targets,
        distances,
        valid,
    }
}

/// Deform the rigidly pre-aligned template onto the scan.
///
/// `vertices` is the starting (and displacement-reference) geometry. The
/// budget and cancellation token are honored at the start of every
/// iteration; on expiry the current geometry is reported unconverged.
pub fn deform_to_scan(
    vertices: &[Point3<f32>],
    faces: &[[u32; 3]],
    target_points: &[Point3<f32>],
    pins: &[LandmarkPin],
    config: &NonRigidConfig,
    budget: &JobBudget,
    cancel: &CancelToken,
) -> Result<NonRigidResult> {
    if vertices.is_empty() {
        return Err(FaceForgeError::EmptyInput("template vertices"));
    }
    let n = vertices.len();
    let tree = KdTree::build(target_points)?;

    info!(
        vertices = n,
        faces = faces.len(),
        target = target_points.len(),
        "non-rigid deformation start"
    );

    // αLᵀL is assembled once; per-iteration changes are diagonal only.
    let laplacian = build_laplacian(n, faces);
    let stiffness_base = laplacian.matmul(&laplacian).scaled(config.stiffness);

    // Landmark pins contribute a constant diagonal and RHS term.
    let mut pin_diag = vec![0.0f64; n];
    let mut pin_rhs = vec![[0.0f64; 3]; n];
    for pin in pins {
        if pin.vertex >= n {
            warn!(vertex = pin.vertex, "landmark pin outside mesh, ignored");
            continue;
        }
        pin_diag[pin.vertex] += config.landmark_weight;
        for dim in 0..3 {
            pin_rhs[pin.vertex][dim] += config.landmark_weight * pin.target[dim] as f64;
        }
    }

    let mut current: Vec<[f64; 3]> = vertices
        .iter()
        .map(|p| [p.x as f64, p.y as f64, p.z as f64])
        .collect();
    let mut converged = false;
    let mut iterations_used = 0;

    for iteration in 0..config.max_iterations {
        if budget.expired() {
            warn!(iteration, "non-rigid deformation hit the wall-clock budget");
            break;
        }
        cancel.check()?;

        let current_points: Vec<Point3<f32>> = current
            .iter()
            .map(|v| Point3::new(v[0] as f32, v[1] as f32, v[2] as f32))
            .collect();
        let corr = find_correspondences(
            &current_points,
            &tree,
            target_points,
            config.max_correspondence_distance,
        );

        if iteration % 10 == 0 {
            let n_valid = corr.valid.iter().filter(|&&v| v).count();
            let mean_mm = if n_valid > 0 {
                corr.distances
                    .iter()
                    .zip(&corr.valid)
                    .filter(|&(_, &v)| v)
                    .map(|(&d, _)| d as f64)
                    .sum::<f64>()
                    / n_valid as f64
                    * 1000.0
            } else {
                f64::INFINITY
            };
            debug!(iteration, valid = n_valid, total = n, mean_mm, "correspondence pass");
        }

        // System: (W + αLᵀL + diag(pins)) x = W p + αLᵀL x_cur + pin targets,
        // independent per coordinate.
        let shift: Vec<f64> = corr
            .valid
            .iter()
            .zip(&pin_diag)
            .map(|(&ok, &pin)| if ok { 1.0 + pin } else { pin })
            .collect();

        let solved: Result<Vec<Vec<f64>>> = (0..3usize)
            .into_par_iter()
            .map(|dim| {
                let x_cur: Vec<f64> = current.iter().map(|v| v[dim]).collect();
                let mut rhs = vec![0.0f64; n];
                stiffness_base.spmv(&x_cur, &mut rhs);
                for i in 0..n {
                    if corr.valid[i] {
                        rhs[i] += corr.targets[i][dim] as f64;
                    }
                    rhs[i] += pin_rhs[i][dim];
                }
                solve_spd(&stiffness_base, &shift, &rhs, &x_cur).map(|(x, _)| x)
            })
            .collect();

        let solved = match solved {
            Ok(solved) => solved,
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, iteration, "sparse solve degraded, keeping current geometry");
                break;
            }
            Err(err) => return Err(err),
        };

        let mut change_sq_sum = 0.0f64;
        for (slot, &x, &y, &z) in izip!(current.iter_mut(), &solved[0], &solved[1], &solved[2]) {
            let dx = x - slot[0];
            let dy = y - slot[1];
            let dz = z - slot[2];
            change_sq_sum += dx * dx + dy * dy + dz * dz;
            *slot = [x, y, z];
        }
        let rms_change = (change_sq_sum / n as f64).sqrt();
        iterations_used = iteration + 1;

        if rms_change < config.convergence_threshold {
            debug!(iteration, rms_change, "non-rigid deformation converged");
            converged = true;
            break;
        }
    }

    let deformed_vertices: Vec<Point3<f32>> = current
        .iter()
        .map(|v| Point3::new(v[0] as f32, v[1] as f32, v[2] as f32))
        .collect();

    // Final error report at a looser radius than the solve used.
    let report = find_correspondences(
        &deformed_vertices,
        &tree,
        target_points,
        config.max_correspondence_distance * 2.0,
    );
    let valid_errors: Vec<f64> = report
        .distances
        .iter()
        .zip(&report.valid)
        .filter(|&(_, &ok)| ok)
        .map(|(&d, _)| d as f64)
        .collect();
    let (mean_error, max_error, p95_error) = if valid_errors.is_empty() {
        (f64::INFINITY, f64::INFINITY, f64::INFINITY)
    } else {
        (
            valid_errors.iter().sum::<f64>() / valid_errors.len() as f64,
            valid_errors.iter().cloned().fold(0.0, f64::max),
            percentile(&valid_errors, 95.0),
        )
    };

    let displacements: Vec<Vector3<f32>> = deformed_vertices
        .iter()
        .zip(vertices)
        .map(|(d, b)| d - b)
        .collect();

    info!(
        iterations = iterations_used,
        converged,
        mean_mm = mean_error * 1000.0,
        p95_mm = p95_error * 1000.0,
        "non-rigid deformation finished"
    );

    Ok(NonRigidResult {
        deformed_vertices,
        displacements,
        vertex_errors: report.distances,
        mean_error,
        max_error,
        p95_error,
        iterations_used,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NonRigidConfig;

    /// A small grid mesh in the xy plane.
    fn grid_mesh(side: usize, spacing: f32) -> (Vec<Point3<f32>>, Vec<[u32; 3]>) {
        let mut vertices = Vec::new();
        for y in 0..side {
            for x in 0..side {
                vertices.push(Point3::new(x as f32 * spacing, y as f32 * spacing, 0.0));
            }
        }
        let mut faces = Vec::new();
        for y in 0..side - 1 {
            for x in 0..side - 1 {
                let a = (y * side + x) as u32;
                let b = a + 1;
                let c = a + side as u32;
                let d = c + 1;
                faces.push([a, b, c]);
                faces.push([b, d, c]);
            }
        }
        (vertices, faces)
    }

    fn run(
        vertices: &[Point3<f32>],
        faces: &[[u32; 3]],
        target: &[Point3<f32>],
        config: &NonRigidConfig,
    ) -> NonRigidResult {
        deform_to_scan(
            vertices,
            faces,
            target,
            &[],
            config,
            &JobBudget::new(30.0),
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn identical_target_yields_zero_displacement() {
        let (vertices, faces) = grid_mesh(6, 0.01);
        let config = NonRigidConfig::default();
        let result = run(&vertices, &faces, &vertices, &config);
        assert!(result.converged);
        let max_disp = result
            .displacements
            .iter()
            .map(|d| d.norm())
            .fold(0.0f32, f32::max);
        assert!(max_disp < 1e-5, "max displacement {}", max_disp);
        assert!(result.mean_error < 1e-6);
    }

    #[test]
    fn pulls_toward_offset_target() {
        let (vertices, faces) = grid_mesh(6, 0.01);
        let target: Vec<Point3<f32>> = vertices
            .iter()
            .map(|p| Point3::new(p.x, p.y, p.z + 0.005))
            .collect();
        let mut config = NonRigidConfig::default();
        config.stiffness = 1.0;
        let result = run(&vertices, &faces, &target, &config);

        let mean_dz: f32 = result.displacements.iter().map(|d| d.z).sum::<f32>()
            / result.displacements.len() as f32;
        assert!(mean_dz > 0.002, "mean dz {}", mean_dz);
        assert!(result.p95_error < 0.004);
    }

    #[test]
    fn landmark_pin_dominates_its_vertex() {
        let (vertices, faces) = grid_mesh(6, 0.01);
        let pin_target = Point3::new(0.02, 0.02, 0.01);
        let pins = [LandmarkPin {
            vertex: 14,
            target: pin_target,
        }];
        let mut config = NonRigidConfig::default();
        config.stiffness = 0.5;
        let result = deform_to_scan(
            &vertices,
            &faces,
            &vertices,
            &pins,
            &config,
            &JobBudget::new(30.0),
            &CancelToken::new(),
        )
        .unwrap();
        let moved = result.deformed_vertices[14];
        let start_gap = (vertices[14] - pin_target).norm();
        let end_gap = (moved - pin_target).norm();
        assert!(end_gap < 0.5 * start_gap, "vertex at {:?}", moved);
        assert!(moved.z > 0.004, "pin barely moved the vertex: {:?}", moved);
    }

    #[test]
    fn timeout_reports_unconverged() {
        let (vertices, faces) = grid_mesh(6, 0.01);
        let result = deform_to_scan(
            &vertices,
            &faces,
            &vertices,
            &[],
            &NonRigidConfig::default(),
            &JobBudget::new(0.0),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations_used, 0);
    }

    #[test]
    fn cancellation_is_terminal() {
        let (vertices, faces) = grid_mesh(4, 0.01);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = deform_to_scan(
            &vertices,
            &faces,
            &vertices,
            &[],
            &NonRigidConfig::default(),
            &JobBudget::new(30.0),
            &cancel,
        );
        assert!(matches!(result, Err(FaceForgeError::Cancelled)));
    }

    #[test]
    fn blended_interpolates_base_and_deformed() {
        let (vertices, faces) = grid_mesh(4, 0.01);
        let target: Vec<Point3<f32>> = vertices
            .iter()
            .map(|p| Point3::new(p.x, p.y, p.z + 0.004))
            .collect();
        let result = run(&vertices, &faces, &target, &NonRigidConfig::default());
        let half = result.blended(&vertices, 0.5);
        for ((b, h), d) in vertices.iter().zip(&half).zip(&result.displacements) {
            let expected = b + d * 0.5;
            assert!((h - expected).norm() < 1e-6);
        }
    }
}
