//! Binary overlay pack
//!
//! A render-time companion to the fitted mesh: the (cropped, down-sampled)
//! scan points with a k-NN binding map onto the fitted vertices. Buffers are
//! raw little-endian with a JSON manifest declaring dtypes and counts.

use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OverlayConfig;
use crate::error::Result;
use crate::geometry::{voxel_downsample, KdTree, PointCloud};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayMeta {
    pub enabled: bool,
    pub count: usize,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knn_k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[[f32; 3]; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_dist_m: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voxel_size: Option<f32>,
}

/// The assembled overlay buffers.
#[derive(Debug, Clone)]
pub struct OverlayPack {
    pub points: Vec<Point3<f32>>,
    pub colors: Vec<[f32; 3]>,
    /// `count * knn_k` vertex indices.
    pub indices: Vec<u32>,
    /// `count * knn_k` normalized inverse-distance weights.
    pub weights: Vec<f32>,
    /// Residual between each point and its weighted vertex blend.
    pub offsets: Vec<[f32; 3]>,
    pub meta: OverlayMeta,
}

/// Build the overlay pack for a fitted mesh.
pub fn build_overlay_pack(
    cloud: &PointCloud,
    fitted_vertices: &[Point3<f32>],
    config: &OverlayConfig,
    seed: u64,
) -> Result<OverlayPack> {
    let disabled = |count: usize, reason: &str| OverlayPack {
        points: Vec::new(),
        colors: Vec::new(),
        indices: Vec::new(),
        weights: Vec::new(),
        offsets: Vec::new(),
        meta: OverlayMeta {
            enabled: false,
            count,
            version: config.version.clone(),
            reason: Some(reason.to_string()),
            knn_k: None,
            bbox: None,
            max_dist_m: None,
            voxel_size: None,
        },
    };

    if cloud.is_empty() || fitted_vertices.is_empty() {
        return Ok(disabled(0, "empty_input"));
    }

    // Crop to points near the fitted surface; keep everything when the mask
    // would discard more than 80% (misaligned fit, still want the overlay).
    let vertex_tree = KdTree::build(fitted_vertices)?;
    let max_dist_sq = config.max_dist_m * config.max_dist_m;
    let near: Vec<usize> = vertex_tree
        .nearest_batch(&cloud.points)
        .iter()
        .enumerate()
        .filter(|&(_, &(_, d_sq))| d_sq <= max_dist_sq)
        .map(|(i, _)| i)
        .collect();
    let cropped = if (near.len() as f32) < cloud.len() as f32 * 0.2 {
        cloud.clone()
    } else {
        cloud.select(&near)
    };

    let mut down = voxel_downsample(&cropped, config.voxel_size);

    if down.len() > config.max_points {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked =
            rand::seq::index::sample(&mut rng, down.len(), config.max_points).into_vec();
        picked.sort_unstable();
        down = down.select(&picked);
    }

    if down.len() < config.min_points {
        debug!(points = down.len(), "overlay disabled: not enough points");
        return Ok(disabled(down.len(), "not_enough_points"));
    }

    // k-NN binding map with normalized inverse-distance weights.
    let k = config.knn_k;
    let mut indices = Vec::with_capacity(down.len() * k);
    let mut weights = Vec::with_capacity(down.len() * k);
    let mut offsets = Vec::with_capacity(down.len());
    for p in &down.points {
        let hit = vertex_tree.knn(p, k);
        let mut w: Vec<f32> = hit
            .distances_sq
            .iter()
            .map(|&d_sq| 1.0 / (d_sq.max(0.0).sqrt() + config.epsilon))
            .collect();
        let sum: f32 = w.iter().sum();
        if sum > 0.0 {
            for v in w.iter_mut() {
                *v /= sum;
            }
        }

        let mut blended = Point3::origin();
        for (&idx, &weight) in hit.indices.iter().zip(&w) {
            blended += fitted_vertices[idx].coords * weight;
        }
        offsets.push([p.x - blended.x, p.y - blended.y, p.z - blended.z]);
        indices.extend(hit.indices.iter().map(|&i| i as u32));
        weights.extend(w);
    }

    let (bbox_min, bbox_max) = down.bounds().expect("down-sampled cloud is non-empty");
    let colors = down
        .colors
        .clone()
        .unwrap_or_else(|| vec![[0.0; 3]; down.len()]);

    Ok(OverlayPack {
        meta: OverlayMeta {
            enabled: true,
            count: down.len(),
            version: config.version.clone(),
            reason: None,
            knn_k: Some(k),
            bbox: Some([
                [bbox_min.x, bbox_min.y, bbox_min.z],
                [bbox_max.x, bbox_max.y, bbox_max.z],
            ]),
            max_dist_m: Some(config.max_dist_m),
            voxel_size: Some(config.voxel_size),
        },
        points: down.points,
        colors,
        indices,
        weights,
        offsets,
    })
}

/// Manifest written beside the binary buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayManifest {
    #[serde(flatten)]
    pub meta: OverlayMeta,
    pub points_bin: String,
    pub colors_bin: String,
    pub indices_bin: String,
    pub weights_bin: String,
    pub offsets_bin: String,
    pub points_dtype: String,
    pub colors_dtype: String,
    pub indices_dtype: String,
    pub weights_dtype: String,
    pub offsets_dtype: String,
}

/// Write the pack as raw little-endian buffers plus a JSON manifest.
/// Returns the manifest path.
pub fn write_overlay_pack(dir: &Path, scan_id: &str, pack: &OverlayPack) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let file_name = |suffix: &str| format!("{}_overlay_{}.bin", scan_id, suffix);

    let mut points_bytes = Vec::with_capacity(pack.points.len() * 12);
    for p in &pack.points {
        for c in [p.x, p.y, p.z] {
            points_bytes.extend_from_slice(&c.to_le_bytes());
        }
    }
    fs::write(dir.join(file_name("points")), &points_bytes)?;

    let color_bytes: Vec<u8> = pack
        .colors
        .iter()
        .flat_map(|c| c.iter().map(|&v| (v.clamp(0.0, 1.0) * 255.0) as u8))
        .collect();
    fs::write(dir.join(file_name("colors")), &color_bytes)?;

    let mut index_bytes = Vec::with_capacity(pack.indices.len() * 4);
    for &i in &pack.indices {
        index_bytes.extend_from_slice(&i.to_le_bytes());
    }
    fs::write(dir.join(file_name("indices")), &index_bytes)?;

    let mut weight_bytes = Vec::with_capacity(pack.weights.len() * 4);
    for &w in &pack.weights {
        weight_bytes.extend_from_slice(&w.to_le_bytes());
    }
    fs::write(dir.join(file_name("weights")), &weight_bytes)?;

    let mut offset_bytes = Vec::with_capacity(pack.offsets.len() * 12);
    for o in &pack.offsets {
        for &c in o {
            offset_bytes.extend_from_slice(&c.to_le_bytes());
        }
    }
    fs::write(dir.join(file_name("offsets")), &offset_bytes)?;

    let manifest = OverlayManifest {
        meta: pack.meta.clone(),
        points_bin: file_name("points"),
        colors_bin: file_name("colors"),
        indices_bin: file_name("indices"),
        weights_bin: file_name("weights"),
        offsets_bin: file_name("offsets"),
        points_dtype: "float32".to_string(),
        colors_dtype: "uint8".to_string(),
        indices_dtype: "uint32".to_string(),
        weights_dtype: "float32".to_string(),
        offsets_dtype: "float32".to_string(),
    };
    let manifest_path = dir.join(format!("{}_overlay_meta.json", scan_id));
    fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_cloud_and_mesh() -> (PointCloud, Vec<Point3<f32>>) {
        let mut points = Vec::new();
        for x in 0..40 {
            for y in 0..40 {
                points.push(Point3::new(x as f32 * 0.002, y as f32 * 0.002, 0.001));
            }
        }
        let cloud = PointCloud::from_points(points);
        let mut mesh = Vec::new();
        for x in 0..10 {
            for y in 0..10 {
                mesh.push(Point3::new(x as f32 * 0.008, y as f32 * 0.008, 0.0));
            }
        }
        (cloud, mesh)
    }

    fn tiny_config() -> OverlayConfig {
        OverlayConfig {
            min_points: 10,
            max_points: 100_000,
            voxel_size: 0.001,
            ..OverlayConfig::default()
        }
    }

    #[test]
    fn weights_are_normalized() {
        let (cloud, mesh) = dense_cloud_and_mesh();
        let pack = build_overlay_pack(&cloud, &mesh, &tiny_config(), 42).unwrap();
        assert!(pack.meta.enabled);
        let k = pack.meta.knn_k.unwrap();
        for chunk in pack.weights.chunks_exact(k) {
            let sum: f32 = chunk.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn cap_is_deterministic_for_a_seed() {
        let (cloud, mesh) = dense_cloud_and_mesh();
        let mut config = tiny_config();
        config.max_points = 200;
        let a = build_overlay_pack(&cloud, &mesh, &config, 42).unwrap();
        let b = build_overlay_pack(&cloud, &mesh, &config, 42).unwrap();
        assert_eq!(a.meta.count, 200);
        assert_eq!(a.points, b.points);
    }

    #[test]
    fn sparse_cloud_disables_pack() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0, 0.0, 0.0)]);
        let mesh = vec![Point3::new(0.0, 0.0, 0.0)];
        let pack = build_overlay_pack(&cloud, &mesh, &tiny_config(), 42).unwrap();
        assert!(!pack.meta.enabled);
        assert_eq!(pack.meta.reason.as_deref(), Some("not_enough_points"));
    }

    #[test]
    fn manifest_and_buffers_round_trip() {
        let (cloud, mesh) = dense_cloud_and_mesh();
        let pack = build_overlay_pack(&cloud, &mesh, &tiny_config(), 42).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = write_overlay_pack(dir.path(), "scan01", &pack).unwrap();

        let manifest: OverlayManifest =
            serde_json::from_slice(&fs::read(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.points_dtype, "float32");

        let points_bytes = fs::read(dir.path().join(&manifest.points_bin)).unwrap();
        assert_eq!(points_bytes.len(), pack.points.len() * 12);
        let x0 = f32::from_le_bytes([
            points_bytes[0],
            points_bytes[1],
            points_bytes[2],
            points_bytes[3],
        ]);
        assert_eq!(x0, pack.points[0].x);
    }
}
