//! Statistical outlier removal
//!
//! Drops points whose mean distance to their `k` nearest neighbors exceeds
//! the global mean by more than `std_ratio` standard deviations.

use rayon::prelude::*;

use super::{KdTree, PointCloud};
use crate::error::Result;

/// Remove statistical outliers from `cloud`.
///
/// Returns the filtered cloud together with the indices kept. A cloud smaller
/// than `neighbors + 1` is returned unchanged.
pub fn remove_statistical_outliers(
    cloud: &PointCloud,
    neighbors: usize,
    std_ratio: f32,
) -> Result<(PointCloud, Vec<usize>)> {
    if cloud.len() <= neighbors + 1 {
        let all: Vec<usize> = (0..cloud.len()).collect();
        return Ok((cloud.clone(), all));
    }

    let tree = KdTree::build(&cloud.points)?;

    // Mean distance to the k nearest neighbors, excluding the point itself.
    let mean_dists: Vec<f32> = cloud
        .points
        .par_iter()
        .map(|p| {
            let result = tree.knn(p, neighbors + 1);
            let sum: f32 = result.distances_sq[1..]
                .iter()
                .map(|d| d.max(0.0).sqrt())
                .sum();
            sum / neighbors as f32
        })
        .collect();

    let n = mean_dists.len() as f32;
    let mean = mean_dists.iter().sum::<f32>() / n;
    let variance = mean_dists.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / n;
    let threshold = mean + std_ratio * variance.sqrt();

    let kept: Vec<usize> = mean_dists
        .iter()
        .enumerate()
        .filter(|&(_, d)| *d <= threshold)
        .map(|(i, _)| i)
        .collect();

    Ok((cloud.select(&kept), kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn drops_isolated_point() {
        let mut points = Vec::new();
        for x in 0..10 {
            for y in 0..10 {
                points.push(Point3::new(x as f32 * 0.01, y as f32 * 0.01, 0.0));
            }
        }
        points.push(Point3::new(5.0, 5.0, 5.0));
        let cloud = PointCloud::from_points(points);

        let (filtered, kept) = remove_statistical_outliers(&cloud, 8, 2.0).unwrap();
        assert_eq!(filtered.len(), kept.len());
        assert!(filtered.len() < cloud.len());
        assert!(filtered
            .points
            .iter()
            .all(|p| (p - Point3::new(5.0, 5.0, 5.0)).norm() > 1.0));
    }

    #[test]
    fn tiny_cloud_passes_through() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0, 0.0, 0.0)]);
        let (filtered, kept) = remove_statistical_outliers(&cloud, 20, 2.0).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(kept, vec![0]);
    }
}
