//! Voxel down-sampling
//!
//! Groups points by integer lattice cell and emits one centroid per non-empty
//! cell. Result order is deterministic: cells are visited in lattice order.

use std::collections::BTreeMap;

use nalgebra::{Point3, Vector3};

use super::PointCloud;

#[derive(Debug, Clone, Copy, Default)]
struct CellAccum {
    sum: Vector3<f64>,
    color_sum: Vector3<f64>,
    count: usize,
}

/// Down-sample `cloud` onto a lattice of `voxel_size` cells.
///
/// Colors, when present, are averaged per cell. A non-positive voxel size
/// returns the input unchanged.
pub fn voxel_downsample(cloud: &PointCloud, voxel_size: f32) -> PointCloud {
    if cloud.is_empty() || voxel_size <= 0.0 {
        return cloud.clone();
    }
    let inv = 1.0 / voxel_size as f64;

    let mut cells: BTreeMap<(i64, i64, i64), CellAccum> = BTreeMap::new();
    for (i, p) in cloud.points.iter().enumerate() {
        let key = (
            (p.x as f64 * inv).floor() as i64,
            (p.y as f64 * inv).floor() as i64,
            (p.z as f64 * inv).floor() as i64,
        );
        let accum = cells.entry(key).or_default();
        accum.sum += Vector3::new(p.x as f64, p.y as f64, p.z as f64);
        if let Some(colors) = &cloud.colors {
            let c = colors[i];
            accum.color_sum += Vector3::new(c[0] as f64, c[1] as f64, c[2] as f64);
        }
        accum.count += 1;
    }

    let mut points = Vec::with_capacity(cells.len());
    let mut colors = cloud.colors.as_ref().map(|_| Vec::with_capacity(cells.len()));
    for accum in cells.values() {
        let inv_count = 1.0 / accum.count as f64;
        let centroid = accum.sum * inv_count;
        points.push(Point3::new(
            centroid.x as f32,
            centroid.y as f32,
            centroid.z as f32,
        ));
        if let Some(colors) = colors.as_mut() {
            let c = accum.color_sum * inv_count;
            colors.push([c.x as f32, c.y as f32, c.z as f32]);
        }
    }

    PointCloud {
        points,
        colors,
        normals: None,
    }
}
