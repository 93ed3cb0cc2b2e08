//! Geometry kernel
//!
//! Shared geometric substrate for the fitter and the deformer: point cloud
//! container, KD-tree nearest-neighbor search, voxel down-sampling, normal
//! estimation and rigid ICP.

pub mod downsample;
pub mod filter;
pub mod icp;
pub mod kdtree;
pub mod normals;

pub use downsample::voxel_downsample;
pub use filter::remove_statistical_outliers;
pub use icp::{icp_rigid, IcpResult};
pub use kdtree::KdTree;
pub use normals::estimate_normals;

use nalgebra::{Point3, Vector3};

use crate::error::{FaceForgeError, Result};

/// An ordered point set in meters, optionally carrying RGB colors in `[0, 1]`
/// and unit normals.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    pub points: Vec<Point3<f32>>,
    pub colors: Option<Vec<[f32; 3]>>,
    pub normals: Option<Vec<Vector3<f32>>>,
}

impl PointCloud {
    pub fn from_points(points: Vec<Point3<f32>>) -> Self {
        Self {
            points,
            colors: None,
            normals: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Axis-aligned bounds, `None` for an empty cloud.
    pub fn bounds(&self) -> Option<(Point3<f32>, Point3<f32>)> {
        let first = *self.points.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.points[1..] {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some((min, max))
    }

    /// Length of the bounding-box diagonal, 0 for an empty cloud.
    pub fn bbox_diagonal(&self) -> f32 {
        match self.bounds() {
            Some((min, max)) => (max - min).norm(),
            None => 0.0,
        }
    }

    pub fn centroid(&self) -> Option<Point3<f32>> {
        if self.points.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3::zeros(), |acc, p| acc + p.coords);
        Some(Point3::from(sum / self.points.len() as f32))
    }

    /// Mean of the per-axis extents.
    pub fn mean_extent(&self) -> f32 {
        match self.bounds() {
            Some((min, max)) => {
                let extent = max - min;
                (extent.x + extent.y + extent.z) / 3.0
            }
            None => 0.0,
        }
    }

    /// Uniformly scale every point about the origin.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            points: self.points.iter().map(|p| p * factor).collect(),
            colors: self.colors.clone(),
            normals: self.normals.clone(),
        }
    }

    /// Keep the points at `indices`, carrying colors and normals along.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            colors: self
                .colors
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
            normals: self
                .normals
                .as_ref()
                .map(|n| indices.iter().map(|&i| n[i]).collect()),
        }
    }

    /// Reject clouds containing NaN or infinite coordinates.
    pub fn validate_finite(&self) -> Result<()> {
        for (i, p) in self.points.iter().enumerate() {
            if !p.coords.iter().all(|c| c.is_finite()) {
                return Err(FaceForgeError::InputInvalid(format!(
                    "non-finite coordinate at point {}",
                    i
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bounds_and_diagonal() {
        let cloud = PointCloud::from_points(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 2.0, 2.0),
        ]);
        let (min, max) = cloud.bounds().unwrap();
        assert_eq!(min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(max, Point3::new(1.0, 2.0, 2.0));
        assert_relative_eq!(cloud.bbox_diagonal(), 3.0);
    }

    #[test]
    fn select_carries_attributes() {
        let mut cloud = PointCloud::from_points(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ]);
        cloud.colors = Some(vec![[0.1, 0.2, 0.3], [0.4, 0.5, 0.6], [0.7, 0.8, 0.9]]);
        let picked = cloud.select(&[2, 0]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.points[0], Point3::new(2.0, 0.0, 0.0));
        assert_eq!(picked.colors.unwrap()[0], [0.7, 0.8, 0.9]);
    }

    #[test]
    fn non_finite_coordinates_rejected() {
        let cloud = PointCloud::from_points(vec![Point3::new(f32::NAN, 0.0, 0.0)]);
        assert!(cloud.validate_finite().is_err());
    }
}
