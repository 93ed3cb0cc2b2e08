//! Composite loss assembly
//!
//! Chamfer + point-to-plane + landmark + priors over the transformed model
//! vertices. Correspondences, region weights and trimming decisions are made
//! on detached values each step; the residuals themselves stay on the tape.

use burn::tensor::{Tensor, TensorData};
use nalgebra::{Matrix3, Point3, Vector3};

use crate::config::FitConfig;
use crate::error::{FaceForgeError, Result};
use crate::geometry::KdTree;
use crate::landmarks::{LandmarkEmbedding, LandmarkEvaluator, NOSE_TIP_INDEX};
use crate::metrics::percentile;
use crate::model::flame::{indices_to_tensor, points_to_tensor, tensor_to_points};
use crate::model::{FitBackend, FitDevice, FlameModel};

type B = FitBackend;

/// Fixed rigid pre-alignment mapping neutral model space into the scan
/// frame. Estimated once by ICP before stage 1 and never re-estimated inside
/// the optimizer.
#[derive(Debug, Clone)]
pub struct Prealign {
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
}

impl Prealign {
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn apply(&self, p: &Point3<f32>) -> Point3<f32> {
        Point3::from(self.rotation * p.coords + self.translation)
    }
}

/// Per-term values of one composite evaluation, detached.
#[derive(Debug, Clone, Copy)]
pub struct LossBreakdown {
    pub composite: f64,
    pub chamfer: f64,
    pub point_to_plane: f64,
    pub landmark: f64,
    pub prior: f64,
}

/// The parameter tensors of one optimizer step.
pub struct ParamTensors {
    pub shape: Tensor<B, 1>,
    pub expression: Tensor<B, 1>,
    pub pose: Tensor<B, 1>,
    pub scale: Tensor<B, 2>,       // [1, 1]
    pub translation: Tensor<B, 2>, // [1, 3]
}

/// Loss assembly context over a fixed cloud and pre-alignment.
pub struct LossContext<'a> {
    model: &'a FlameModel,
    evaluator: &'a LandmarkEvaluator,
    config: &'a FitConfig,
    cloud_points: &'a [Point3<f32>],
    cloud_normals: &'a [Vector3<f32>],
    cloud_tree: KdTree<'a>,
    prealign_rot: Tensor<B, 2>,   // [3, 3]
    prealign_trans: Tensor<B, 2>, // [1, 3]
    mouth_weights: Vec<f32>,
    device: FitDevice,
}

impl<'a> LossContext<'a> {
    pub fn new(
        model: &'a FlameModel,
        evaluator: &'a LandmarkEvaluator,
        embedding: &'a LandmarkEmbedding,
        config: &'a FitConfig,
        cloud_points: &'a [Point3<f32>],
        cloud_normals: &'a [Vector3<f32>],
        prealign: &Prealign,
    ) -> Result<Self> {
        if cloud_points.len() != cloud_normals.len() {
            return Err(FaceForgeError::InputInvalid(
                "cloud normals missing for loss assembly".to_string(),
            ));
        }
        let cloud_tree = KdTree::build(cloud_points)?;
        let device = *model.device();

        let mut mouth_weights = vec![1.0f32; embedding.len()];
        for idx in embedding.mouth_indices() {
            mouth_weights[idx] = config.w_mouth_multiplier;
        }

        let mut rot_flat = Vec::with_capacity(9);
        for r in 0..3 {
            for c in 0..3 {
                rot_flat.push(prealign.rotation[(r, c)]);
            }
        }
        let prealign_rot = Tensor::from_data(TensorData::new(rot_flat, [3, 3]), &device);
        let prealign_trans = Tensor::from_data(
            TensorData::new(prealign.translation.as_slice().to_vec(), [1, 3]),
            &device,
        );

        Ok(Self {
            model,
            evaluator,
            config,
            cloud_points,
            cloud_normals,
            cloud_tree,
            prealign_rot,
            prealign_trans,
            mouth_weights,
            device,
        })
    }

    /// Transformed vertices on the tape: `v = (V·Rᵀ + t)·s + τ`.
    pub fn world_vertices(&self, params: &ParamTensors) -> Tensor<B, 2> {
        let model_verts = self.model.evaluate(
            params.shape.clone(),
            params.expression.clone(),
            params.pose.clone(),
        );
        let aligned =
            model_verts.matmul(self.prealign_rot.clone().transpose()) + self.prealign_trans.clone();
        aligned * params.scale.clone() + params.translation.clone()
    }

    /// Evaluate vertices and landmarks detached, for metrics and export.
    pub fn world_vertices_detached(
        &self,
        params: &ParamTensors,
    ) -> (Vec<Point3<f32>>, Vec<Point3<f32>>) {
        let verts = self.world_vertices(params).detach();
        let landmarks = tensor_to_points(self.evaluator.evaluate(verts.clone()));
        (tensor_to_points(verts), landmarks)
    }

    /// Assemble the composite loss for the current parameters.
    pub fn composite(&self, params: &ParamTensors) -> (Tensor<B, 1>, LossBreakdown) {
        let verts_world = self.world_vertices(params);
        let verts_detached = tensor_to_points(verts_world.clone().detach());

        let landmark_tensor = self.evaluator.evaluate(verts_world.clone());
        let landmarks_detached = tensor_to_points(landmark_tensor.clone().detach());

        // Nearest-neighbor passes on detached geometry.
        let source_nn = self.cloud_tree.nearest_batch(&verts_detached);
        let source_dist: Vec<f64> = source_nn
            .iter()
            .map(|&(_, d_sq)| (d_sq as f64).max(0.0).sqrt())
            .collect();

        let vertex_tree = KdTree::build(&verts_detached)
            .expect("world vertices are non-empty");
        let target_nn = vertex_tree.nearest_batch(self.cloud_points);
        let target_dist: Vec<f64> = target_nn
            .iter()
            .map(|&(_, d_sq)| (d_sq as f64).max(0.0).sqrt())
            .collect();

        // Region weights: the nose sphere depends on a detached landmark, so
        // the weight assignment is piecewise constant within a step
        // (stop-gradient by construction).
        let weights = self.region_weights(&verts_detached, &landmarks_detached);

        // Quantile trimming, applied to weights in lockstep.
        let (kept_src, kept_tgt) = self.trim(&source_dist, &target_dist);

        let kept_weights: Vec<f32> = kept_src.iter().map(|&i| weights[i]).collect();
        let kept_targets: Vec<Point3<f32>> = kept_src
            .iter()
            .map(|&i| self.cloud_points[source_nn[i].0])
            .collect();
        let kept_normals: Vec<Vector3<f32>> = kept_src
            .iter()
            .map(|&i| self.cloud_normals[source_nn[i].0])
            .collect();

        let k = kept_src.len();
        let v_src = verts_world
            .clone()
            .select(0, indices_to_tensor(&kept_src, &self.device));
        let c_src = points_to_tensor(&kept_targets, &self.device);
        let w_src: Tensor<B, 2> =
            Tensor::from_data(TensorData::new(kept_weights, [k, 1]), &self.device);

        let diff = v_src - c_src;
        let dist = (diff.clone() * diff.clone())
            .sum_dim(1)
            .add_scalar(1e-12)
            .sqrt();

        let chamfer_source = (dist * w_src.clone()).mean();

        // Point-to-plane: residual projected on the target normal, Huberized.
        let mut normal_flat = Vec::with_capacity(k * 3);
        for n in &kept_normals {
            normal_flat.extend_from_slice(&[n.x, n.y, n.z]);
        }
        let n_src: Tensor<B, 2> =
            Tensor::from_data(TensorData::new(normal_flat, [k, 3]), &self.device);
        let plane_residual = (diff * n_src).sum_dim(1);
        let point_to_plane =
            (huber(plane_residual, self.config.huber_delta) * w_src).mean();

        // Target-side chamfer over kept cloud points.
        let sigma_vertices: Vec<usize> = kept_tgt.iter().map(|&j| target_nn[j].0).collect();
        let kept_cloud: Vec<Point3<f32>> =
            kept_tgt.iter().map(|&j| self.cloud_points[j]).collect();
        let v_tgt = verts_world.select(0, indices_to_tensor(&sigma_vertices, &self.device));
        let c_tgt = points_to_tensor(&kept_cloud, &self.device);
        let tdiff = v_tgt - c_tgt;
        let chamfer_target = (tdiff.clone() * tdiff)
            .sum_dim(1)
            .add_scalar(1e-12)
            .sqrt()
            .mean();

        let chamfer = chamfer_source + chamfer_target;

        // Landmark term: distance to the nearest cloud point, Huberized and
        // mouth-upweighted.
        let landmark = if self.evaluator.is_empty() {
            Tensor::<B, 1>::zeros([1], &self.device)
        } else {
            let nearest: Vec<Point3<f32>> = landmarks_detached
                .iter()
                .map(|l| self.cloud_points[self.cloud_tree.nearest(l).0])
                .collect();
            let l_target = points_to_tensor(&nearest, &self.device);
            let l_count = self.mouth_weights.len();
            let l_weights: Tensor<B, 2> = Tensor::from_data(
                TensorData::new(self.mouth_weights.clone(), [l_count, 1]),
                &self.device,
            );
            let ldiff = landmark_tensor - l_target;
            let ldist = (ldiff.clone() * ldiff)
                .sum_dim(1)
                .add_scalar(1e-12)
                .sqrt();
            (huber(ldist, self.config.huber_delta) * l_weights).mean()
        };

        // Coefficient priors.
        let prior = params
            .shape
            .clone()
            .powf_scalar(2.0)
            .mean()
            .mul_scalar(self.config.w_prior_shape)
            + params
                .expression
                .clone()
                .powf_scalar(2.0)
                .mean()
                .mul_scalar(self.config.w_prior_expr)
            + params
                .pose
                .clone()
                .slice([3..6])
                .powf_scalar(2.0)
                .mean()
                .mul_scalar(self.config.w_prior_jaw);

        let composite = chamfer.clone().mul_scalar(self.config.w_chamfer)
            + point_to_plane.clone().mul_scalar(self.config.w_point2plane)
            + landmark.clone().mul_scalar(self.config.w_landmark)
            + prior.clone();

        let breakdown = LossBreakdown {
            composite: scalar(&composite),
            chamfer: scalar(&chamfer),
            point_to_plane: scalar(&point_to_plane),
            landmark: scalar(&landmark),
            prior: scalar(&prior),
        };

        (composite, breakdown)
    }

    fn region_weights(
        &self,
        vertices: &[Point3<f32>],
        landmarks: &[Point3<f32>],
    ) -> Vec<f32> {
        let radius = self.config.nose_radius_mm * 1e-3;
        match landmarks.get(NOSE_TIP_INDEX) {
            Some(nose) if radius > 0.0 => vertices
                .iter()
                .map(|v| {
                    if (v - nose).norm() <= radius {
                        self.config.w_nose_multiplier
                    } else {
                        1.0
                    }
                })
                .collect(),
            _ => vec![1.0; vertices.len()],
        }
    }

    fn trim(&self, source_dist: &[f64], target_dist: &[f64]) -> (Vec<usize>, Vec<usize>) {
        match self.config.trim_percentile {
            Some(q) if q > 0.0 && q < 1.0 => {
                let src_cut = percentile(source_dist, q as f64 * 100.0);
                let tgt_cut = percentile(target_dist, q as f64 * 100.0);
                let kept_src = source_dist
                    .iter()
                    .enumerate()
                    .filter(|&(_, d)| *d <= src_cut)
                    .map(|(i, _)| i)
                    .collect();
                let kept_tgt = target_dist
                    .iter()
                    .enumerate()
                    .filter(|&(_, d)| *d <= tgt_cut)
                    .map(|(i, _)| i)
                    .collect();
                (kept_src, kept_tgt)
            }
            _ => (
                (0..source_dist.len()).collect(),
                (0..target_dist.len()).collect(),
            ),
        }
    }
}

/// Piecewise quadratic-linear robust loss with knee `delta`.
pub fn huber<const D: usize>(residual: Tensor<B, D>, delta: f32) -> Tensor<B, D> {
    let abs = residual.clone().abs();
    let quadratic = residual.clone() * residual * 0.5;
    let linear = (abs.clone() - delta * 0.5) * delta;
    let mask = abs.lower_equal_elem(delta);
    linear.mask_where(mask, quadratic)
}

fn scalar(t: &Tensor<B, 1>) -> f64 {
    t.clone().detach().into_scalar() as f64
}
