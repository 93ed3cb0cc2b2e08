//! Normal estimation
//!
//! Per-point PCA over a radius neighborhood; the normal is the eigenvector of
//! the smallest covariance eigenvalue. Signs are propagated along a minimum
//! spanning tree of the neighbor graph so adjacent normals agree.

use std::collections::BinaryHeap;

use nalgebra::{Matrix3, Point3, Vector3};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use tracing::debug;

use super::KdTree;
use crate::error::Result;

/// Estimated normals plus the count of degenerate neighborhoods that fell
/// back to the z-axis.
#[derive(Debug, Clone)]
pub struct NormalEstimate {
    pub normals: Vec<Vector3<f32>>,
    pub degenerate_count: usize,
}

/// Estimate unit normals for `points` using PCA over up to `max_nn` neighbors
/// within `radius`.
///
/// A rank-deficient neighborhood yields the z-axis as fallback and is counted
/// in `degenerate_count`.
pub fn estimate_normals(
    points: &[Point3<f32>],
    radius: f32,
    max_nn: usize,
) -> Result<NormalEstimate> {
    let tree = KdTree::build(points)?;

    let per_point: Vec<(Vector3<f32>, bool)> = points
        .par_iter()
        .map(|p| {
            let neighbors = tree.radius(p, radius, max_nn);
            pca_normal(points, &neighbors.indices)
        })
        .collect();

    let degenerate_count = per_point.iter().filter(|&&(_, bad)| bad).count();
    let mut normals: Vec<Vector3<f32>> = per_point.into_iter().map(|(n, _)| n).collect();

    if degenerate_count > 0 {
        debug!(
            degenerate = degenerate_count,
            total = points.len(),
            "degenerate PCA neighborhoods fell back to z-axis"
        );
    }

    orient_consistently(points, &tree, &mut normals);

    Ok(NormalEstimate {
        normals,
        degenerate_count,
    })
}

/// PCA over the neighborhood; returns `(normal, degenerate)`.
fn pca_normal(points: &[Point3<f32>], neighborhood: &[usize]) -> (Vector3<f32>, bool) {
    if neighborhood.len() < 3 {
        return (Vector3::z(), true);
    }

    let mut centroid = Vector3::<f64>::zeros();
    for &i in neighborhood {
        centroid += points[i].coords.cast::<f64>();
    }
    centroid /= neighborhood.len() as f64;

    let mut cov = Matrix3::<f64>::zeros();
    for &i in neighborhood {
        let d = points[i].coords.cast::<f64>() - centroid;
        cov += d * d.transpose();
    }
    cov /= neighborhood.len() as f64;

    let eigen = cov.symmetric_eigen();
    let mut smallest = 0;
    let mut largest = 0;
    for k in 1..3 {
        if eigen.eigenvalues[k] < eigen.eigenvalues[smallest] {
            smallest = k;
        }
        if eigen.eigenvalues[k] > eigen.eigenvalues[largest] {
            largest = k;
        }
    }

    // Rank-deficient neighborhoods (coincident or collinear points) have a
    // middle eigenvalue indistinguishable from zero.
    let mid = 3 - smallest - largest;
    let scale = eigen.eigenvalues[largest];
    if !scale.is_finite() || scale <= 0.0 || eigen.eigenvalues[mid] <= scale * 1e-9 {
        return (Vector3::z(), true);
    }

    let normal = eigen.eigenvectors.column(smallest).into_owned();
    let norm = normal.norm();
    if norm <= 0.0 || !norm.is_finite() {
        return (Vector3::z(), true);
    }
    let normal = normal / norm;
    (
        Vector3::new(normal.x as f32, normal.y as f32, normal.z as f32),
        false,
    )
}

/// Propagate normal signs over a minimum spanning tree of the k-NN graph.
///
/// Each connected component is seeded at its topmost point with the normal
/// oriented toward +z; traversal flips any child whose normal disagrees with
/// its parent.
fn orient_consistently(points: &[Point3<f32>], tree: &KdTree<'_>, normals: &mut [Vector3<f32>]) {
    let n = points.len();
    if n < 2 {
        return;
    }
    let k = 10.min(n - 1);

    let adjacency: Vec<Vec<usize>> = points
        .par_iter()
        .map(|p| {
            let result = tree.knn(p, k + 1);
            result
                .indices
                .into_iter()
                .filter(|&j| j < n)
                .collect::<Vec<_>>()
        })
        .collect();

    let mut visited = vec![false; n];
    // Lazy Prim. Edge weight is 1 - |n_i . n_j|; the max-heap stores the
    // affinity |n_i . n_j| directly, which pops minimum-weight edges first.
    let mut heap: BinaryHeap<(OrderedFloat<f32>, usize, usize)> = BinaryHeap::new();

    loop {
        // Seed: topmost unvisited point, oriented toward +z.
        let seed = match (0..n).filter(|&i| !visited[i]).max_by(|&a, &b| {
            points[a].z.total_cmp(&points[b].z)
        }) {
            Some(seed) => seed,
            None => break,
        };
        visited[seed] = true;
        if normals[seed].z < 0.0 {
            normals[seed] = -normals[seed];
        }
        for &j in &adjacency[seed] {
            if !visited[j] {
                let affinity = normals[seed].dot(&normals[j]).abs();
                heap.push((OrderedFloat(affinity), j, seed));
            }
        }

        while let Some((_, to, from)) = heap.pop() {
            if visited[to] {
                continue;
            }
            visited[to] = true;
            if normals[from].dot(&normals[to]) < 0.0 {
                normals[to] = -normals[to];
            }
            for &j in &adjacency[to] {
                if !visited[j] {
                    let affinity = normals[to].dot(&normals[j]).abs();
                    heap.push((OrderedFloat(affinity), j, to));
                }
            }
        }
    }
}
