//! Synthetic model fixtures shared by the integration tests.
//!
//! The real model asset is proprietary, so tests run against a small
//! face-like grid template with hand-built blendshape bases and a sparse
//! landmark embedding. The geometry is deterministic; sampling helpers take
//! an explicit seed.

use nalgebra::{Point3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use face_forge::geometry::PointCloud;
use face_forge::model::{FlameAsset, LandmarkEmbeddingAsset};

pub const GRID_SIDE: usize = 15;
pub const GRID_SPACING: f32 = 0.01;

/// A face-like template: a grid in xy with a central gaussian bump toward
/// +z, plus smooth sinusoidal blendshape bases.
pub fn face_like_asset() -> FlameAsset {
    let side = GRID_SIDE;
    let n = side * side;
    let half = (side - 1) as f32 * GRID_SPACING / 2.0;

    let mut template = Vec::with_capacity(n * 3);
    let mut coords = Vec::with_capacity(n);
    for gy in 0..side {
        for gx in 0..side {
            let x = gx as f32 * GRID_SPACING - half;
            let y = gy as f32 * GRID_SPACING - half;
            let z = 0.05 * (-(x * x + y * y) / (2.0 * 0.03 * 0.03)).exp();
            template.extend_from_slice(&[x, y, z]);
            coords.push((x, y));
        }
    }

    let mut faces = Vec::new();
    for gy in 0..side - 1 {
        for gx in 0..side - 1 {
            let a = (gy * side + gx) as u32;
            let b = a + 1;
            let c = a + side as u32;
            let d = c + 1;
            faces.push([a, b, c]);
            faces.push([b, d, c]);
        }
    }

    let n_shape = 8;
    let mut shapedirs = vec![0.0f32; n * 3 * n_shape];
    for (v, &(x, y)) in coords.iter().enumerate() {
        for k in 0..n_shape {
            let freq = (k + 1) as f32 * std::f32::consts::PI / (2.0 * half);
            let dz = 0.004 * (freq * x).sin() * (freq * y).cos();
            shapedirs[(v * 3 + 2) * n_shape + k] = dz;
        }
    }

    let n_expr = 4;
    let mut expdirs = vec![0.0f32; n * 3 * n_expr];
    for (v, &(x, y)) in coords.iter().enumerate() {
        // Expression bases act on the lower half of the grid.
        if y < 0.0 {
            for k in 0..n_expr {
                let freq = (k + 1) as f32 * std::f32::consts::PI / half;
                expdirs[(v * 3 + 2) * n_expr + k] = 0.003 * (freq * x).cos();
                expdirs[(v * 3 + 1) * n_expr + k] = 0.002 * (freq * y).sin();
            }
        }
    }

    let mut jaw_weights = vec![0.0f32; n];
    for (v, &(_, y)) in coords.iter().enumerate() {
        if y < -0.02 {
            jaw_weights[v] = ((-0.02 - y) / 0.03).clamp(0.0, 1.0);
        }
    }

    FlameAsset {
        n_vertices: n,
        n_shape,
        n_expr,
        v_template: template,
        shapedirs,
        expdirs,
        faces,
        jaw_weights,
        jaw_pivot: [0.0, -0.02, 0.0],
    }
}

/// Ten landmarks spread over the grid; index 1 is the bump apex (the nose
/// tip of the synthetic face).
pub fn face_like_embedding() -> LandmarkEmbeddingAsset {
    let side = GRID_SIDE;
    let face_of_cell = |cx: usize, cy: usize| (2 * (cy * (side - 1) + cx)) as u32;
    let center = (side - 1) / 2;

    let cells = [
        (2, 2),
        (center, center), // nose tip
        (center, 2),
        (2, center),
        (side - 3, 2),
        (2, side - 3),
        (side - 3, center),
        (center, side - 3),
        (side - 3, side - 3),
        (center - 2, center - 2),
    ];

    LandmarkEmbeddingAsset {
        face_idx: cells.iter().map(|&(cx, cy)| face_of_cell(cx, cy)).collect(),
        bary: vec![[0.34, 0.33, 0.33]; cells.len()],
    }
}

/// Standard normal via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Sample `n` points from the mesh surface with optional gaussian noise.
pub fn sample_surface(
    vertices: &[Point3<f32>],
    faces: &[[u32; 3]],
    n: usize,
    noise_std: f32,
    seed: u64,
) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(n);
    for _ in 0..n {
        let face = faces[rng.gen_range(0..faces.len())];
        let (r1, r2): (f32, f32) = (rng.gen(), rng.gen());
        let sqrt_r1 = r1.sqrt();
        let w0 = 1.0 - sqrt_r1;
        let w1 = sqrt_r1 * (1.0 - r2);
        let w2 = sqrt_r1 * r2;
        let a = vertices[face[0] as usize].coords;
        let b = vertices[face[1] as usize].coords;
        let c = vertices[face[2] as usize].coords;
        let mut p = a * w0 + b * w1 + c * w2;
        if noise_std > 0.0 {
            p += Vector3::new(
                gaussian(&mut rng) * noise_std,
                gaussian(&mut rng) * noise_std,
                gaussian(&mut rng) * noise_std,
            );
        }
        points.push(Point3::from(p));
    }
    PointCloud::from_points(points)
}

/// Uniform samples on a sphere shell.
pub fn sphere_cloud(n: usize, radius: f32, center: Point3<f32>, seed: u64) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::with_capacity(n);
    for _ in 0..n {
        let dir = Vector3::new(
            gaussian(&mut rng),
            gaussian(&mut rng),
            gaussian(&mut rng),
        );
        let norm = dir.norm();
        if norm <= f32::EPSILON {
            continue;
        }
        points.push(center + dir * (radius / norm));
    }
    PointCloud { points, colors: None, normals: None }
}

/// Neutral template vertices as points.
pub fn template_points(asset: &FlameAsset) -> Vec<Point3<f32>> {
    asset
        .v_template
        .chunks_exact(3)
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect()
}
