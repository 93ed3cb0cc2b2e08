//! Property tests for the geometry kernel and metrics.

mod common;

use nalgebra::{Point3, Rotation3, Vector3};
use proptest::prelude::*;

use face_forge::geometry::{icp_rigid, voxel_downsample, KdTree, PointCloud};
use face_forge::metrics::{landmark_rms_mm, surface_error_metrics};

fn small_point() -> impl Strategy<Value = Point3<f32>> {
    (
        -0.2f32..0.2f32,
        -0.2f32..0.2f32,
        -0.2f32..0.2f32,
    )
        .prop_map(|(x, y, z)| Point3::new(x, y, z))
}

fn small_cloud(min: usize, max: usize) -> impl Strategy<Value = Vec<Point3<f32>>> {
    proptest::collection::vec(small_point(), min..max)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn voxel_downsample_is_idempotent(points in small_cloud(8, 200)) {
        let cloud = PointCloud::from_points(points);
        let once = voxel_downsample(&cloud, 0.02);
        let twice = voxel_downsample(&once, 0.02);

        // A cell's centroid stays inside its cell, so a second pass at the
        // same size must be a fixed point within floating tolerance.
        prop_assert_eq!(once.len(), twice.len());
        for (a, b) in once.points.iter().zip(&twice.points) {
            prop_assert!((a - b).norm() < 1e-5);
        }
    }

    #[test]
    fn knn_matches_brute_force(points in small_cloud(4, 120), query in small_point(), k in 1usize..6) {
        let tree = KdTree::build(&points).unwrap();
        let result = tree.knn(&query, k);

        let mut brute: Vec<f32> = points.iter().map(|p| (p - query).norm_squared()).collect();
        brute.sort_by(|a, b| a.total_cmp(b));

        let valid = k.min(points.len());
        for j in 0..valid {
            prop_assert!((result.distances_sq[j] - brute[j]).abs() <= 1e-6_f32.max(brute[j] * 1e-5));
        }
    }

    #[test]
    fn icp_on_identical_clouds_is_identity(points in small_cloud(16, 150)) {
        let result = icp_rigid(&points, &points, 0.05, 20).unwrap();
        prop_assert!((result.fitness - 1.0).abs() < 1e-6);
        prop_assert!((result.rotation - nalgebra::Matrix3::identity()).norm() < 1e-3);
        prop_assert!(result.translation.norm() < 1e-4);
    }

    #[test]
    fn metrics_invariant_under_rigid_transform(
        points in small_cloud(24, 120),
        angle in -1.0f32..1.0f32,
        tx in -0.5f32..0.5f32,
    ) {
        let mesh: Vec<Point3<f32>> = points.iter().take(points.len() / 2).cloned().collect();
        let cloud: Vec<Point3<f32>> = points.iter().skip(points.len() / 2).cloned().collect();
        prop_assume!(mesh.len() >= 4 && cloud.len() >= 4);

        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), angle);
        let offset = Vector3::new(tx, 0.1, -0.2);
        let map = |p: &Point3<f32>| Point3::from(rotation * p.coords + offset);

        let mesh_t: Vec<Point3<f32>> = mesh.iter().map(map).collect();
        let cloud_t: Vec<Point3<f32>> = cloud.iter().map(map).collect();

        let a = surface_error_metrics(&mesh, &cloud).unwrap();
        let b = surface_error_metrics(&mesh_t, &cloud_t).unwrap();
        prop_assert!((a.mean_mm - b.mean_mm).abs() < 1e-2);
        prop_assert!((a.p95_mm - b.p95_mm).abs() < 1e-2);
        // The 5 mm outlier threshold can flip for a distance sitting exactly
        // on it under float error; allow one point of slack.
        let slack = 1.0 / mesh.len() as f64 + 1e-9;
        prop_assert!((a.outlier_ratio - b.outlier_ratio).abs() <= slack);

        let rms_a = landmark_rms_mm(&mesh, &cloud).unwrap();
        let rms_b = landmark_rms_mm(&mesh_t, &cloud_t).unwrap();
        prop_assert!((rms_a - rms_b).abs() < 1e-2);
    }
}

#[test]
fn landmark_evaluation_is_linear_in_vertices() {
    use face_forge::landmarks::LandmarkEmbedding;

    let asset = common::face_like_asset();
    let embedding_asset = common::face_like_embedding();
    let embedding = LandmarkEmbedding::from_asset(&embedding_asset, &asset.faces).unwrap();

    let v1 = common::template_points(&asset);
    let v2: Vec<Point3<f32>> = v1
        .iter()
        .map(|p| Point3::new(p.x + 0.01, p.y * 1.5, p.z - 0.002))
        .collect();

    let (alpha, beta) = (0.3f32, 0.7f32);
    let mixed: Vec<Point3<f32>> = v1
        .iter()
        .zip(&v2)
        .map(|(a, b)| Point3::from(a.coords * alpha + b.coords * beta))
        .collect();

    let l1 = embedding.evaluate(&v1);
    let l2 = embedding.evaluate(&v2);
    let lm = embedding.evaluate(&mixed);

    for ((a, b), m) in l1.iter().zip(&l2).zip(&lm) {
        let expected = a.coords * alpha + b.coords * beta;
        assert!((m.coords - expected).norm() < 1e-5);
    }
}
