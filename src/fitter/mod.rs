//! Model-space fitter
//!
//! Three-stage gradient optimization over the morphable-model parameters:
//! rigid (pose, translation, scale), expression, shape. Each stage runs Adam
//! with box projection after every step, early stopping on a stale best loss,
//! and a shared wall-clock budget.

pub mod loss;

pub use loss::{LossBreakdown, LossContext, ParamTensors, Prealign};

use std::time::Instant;

use burn::tensor::{Tensor, TensorData};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::FitConfig;
use crate::error::{FaceForgeError, Result};
use crate::geometry::{icp_rigid, voxel_downsample, PointCloud};
use crate::job::{CancelToken, JobBudget};
use crate::landmarks::{LandmarkEmbedding, LandmarkEvaluator};
use crate::model::{FitBackend, FlameModel};

type B = FitBackend;

/// Voxel size used when down-sampling both sides for the ICP pre-alignment.
const ICP_VOXEL_SIZE: f32 = 0.005;
const ICP_MAX_DIST: f32 = 0.02;
const ICP_MAX_ITER: usize = 50;

/// Steps without a >= `EARLY_STOP_MIN_DELTA` improvement before a stage ends.
const EARLY_STOP_PATIENCE: usize = 12;
const EARLY_STOP_MIN_DELTA: f64 = 1e-4;

const ADAM_LR: f32 = 0.01;
const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

const COEFF_LIMIT: f32 = 4.0;
const HEAD_POSE_LIMIT: f32 = 1.0;
const SCALE_RANGE: (f32, f32) = (0.5, 2.0);

/// The optimizable parameter record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlameParams {
    pub shape: Vec<f32>,
    pub expression: Vec<f32>,
    /// Head rotation (3) ⊕ jaw rotation (3), axis-angle.
    pub pose: Vec<f32>,
    pub scale: f32,
    pub translation: [f32; 3],
}

impl FlameParams {
    pub fn zeros(n_shape: usize, n_expr: usize) -> Self {
        Self {
            shape: vec![0.0; n_shape],
            expression: vec![0.0; n_expr],
            pose: vec![0.0; 6],
            scale: 1.0,
            translation: [0.0; 3],
        }
    }
}

/// Per-stage outcome record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub best_loss: f64,
    pub duration_ms: f64,
    pub converged: bool,
}

/// Fit invocation options beyond the static configuration.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub freeze_expression: bool,
    pub freeze_jaw: bool,
    /// Run stage 1 only; set by the orchestrator for sparse clouds.
    pub sparse_mode: bool,
    /// Warm-start identity coefficients, copied into `shape` (clipped to the
    /// box) before stage 1. The fitter is insensitive to their source.
    pub initial_shape: Option<Vec<f32>>,
    /// Global cap across all stages.
    pub max_iters: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            freeze_expression: false,
            freeze_jaw: false,
            sparse_mode: false,
            initial_shape: None,
            max_iters: 360,
        }
    }
}

/// Result of a model-space fit.
#[derive(Debug, Clone)]
pub struct ModelFit {
    pub params: FlameParams,
    pub vertices: Vec<Point3<f32>>,
    pub landmarks: Vec<Point3<f32>>,
    pub stages: Vec<StageRecord>,
    pub prealign: Prealign,
    pub best_loss: f64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct TrainMask {
    pose: bool,
    translation: bool,
    scale: bool,
    expression: bool,
    shape: bool,
}

enum StageOutcome {
    Completed,
    TimedOut,
    IterCapped,
}

/// Staged fitter over a fixed model, embedding and configuration.
pub struct ModelFitter<'a> {
    model: &'a FlameModel,
    embedding: &'a LandmarkEmbedding,
    config: &'a FitConfig,
}

impl<'a> ModelFitter<'a> {
    pub fn new(
        model: &'a FlameModel,
        embedding: &'a LandmarkEmbedding,
        config: &'a FitConfig,
    ) -> Self {
        Self {
            model,
            embedding,
            config,
        }
    }

    /// Fit the model to `cloud_points` (with unit normals), honoring the
    /// wall-clock budget and the cancellation token at the top of every step.
    pub fn fit(
        &self,
        cloud_points: &[Point3<f32>],
        cloud_normals: &[Vector3<f32>],
        options: &FitOptions,
        budget: &JobBudget,
        cancel: &CancelToken,
    ) -> Result<ModelFit> {
        if cloud_points.is_empty() {
            return Err(FaceForgeError::EmptyInput("fit cloud"));
        }

        let (prealign, initial_scale) = self.rigid_initialize(cloud_points)?;

        let mut params = FlameParams::zeros(self.model.n_shape(), self.model.n_expr());
        params.scale = initial_scale;
        if let Some(warm) = &options.initial_shape {
            for (dst, &src) in params.shape.iter_mut().zip(warm.iter()) {
                *dst = src.clamp(-COEFF_LIMIT, COEFF_LIMIT);
            }
            debug!(coefficients = warm.len(), "applied warm-start shape vector");
        }

        let evaluator = LandmarkEvaluator::new(self.embedding, self.model.device());
        let ctx = LossContext::new(
            self.model,
            &evaluator,
            self.embedding,
            self.config,
            cloud_points,
            cloud_normals,
            &prealign,
        )?;

        let mut plan: Vec<(&'static str, usize, TrainMask)> = vec![(
            "rigid",
            self.config.iters_pose,
            TrainMask {
                pose: true,
                translation: true,
                scale: true,
                ..Default::default()
            },
        )];
        if !options.sparse_mode {
            plan.push((
                "expression",
                self.config.iters_expr,
                TrainMask {
                    pose: true,
                    translation: true,
                    scale: true,
                    expression: !options.freeze_expression,
                    ..Default::default()
                },
            ));
            plan.push((
                "shape",
                self.config.iters_shape,
                TrainMask {
                    pose: true,
                    translation: true,
                    scale: true,
                    expression: !options.freeze_expression,
                    shape: true,
                },
            ));
        }

        let mut stages = Vec::with_capacity(plan.len());
        let mut best_loss = f64::INFINITY;
        let mut best_params = params.clone();
        let mut global_steps = 0usize;
        let mut timed_out = false;

        for (name, iters, mask) in plan {
            let started = Instant::now();
            let mut stage_best = f64::INFINITY;
            let mut converged = false;

            let outcome = self.run_stage(
                &ctx,
                &mut params,
                mask,
                iters,
                name,
                options,
                budget,
                cancel,
                &mut global_steps,
                &mut stage_best,
                &mut converged,
                &mut best_loss,
                &mut best_params,
            )?;

            let record = StageRecord {
                name: name.to_string(),
                best_loss: stage_best,
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                converged,
            };
            info!(
                stage = record.name.as_str(),
                best_loss = record.best_loss,
                converged = record.converged,
                "stage finished"
            );
            stages.push(record);

            match outcome {
                StageOutcome::TimedOut => {
                    timed_out = true;
                    break;
                }
                StageOutcome::IterCapped => break,
                StageOutcome::Completed => {}
            }
        }

        let tensors = param_tensors(&best_params, TrainMask::default(), self.model);
        let (vertices, landmarks) = ctx.world_vertices_detached(&tensors);

        Ok(ModelFit {
            params: best_params,
            vertices,
            landmarks,
            stages,
            prealign,
            best_loss,
            timed_out,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_stage(
        &self,
        ctx: &LossContext<'_>,
        params: &mut FlameParams,
        mask: TrainMask,
        iters: usize,
        stage_name: &str,
        options: &FitOptions,
        budget: &JobBudget,
        cancel: &CancelToken,
        global_steps: &mut usize,
        stage_best: &mut f64,
        converged: &mut bool,
        best_loss: &mut f64,
        best_params: &mut FlameParams,
    ) -> Result<StageOutcome> {
        let mut adam = Adam::new(gather(params, mask).len());
        let mut stale = 0usize;

        for _ in 0..iters {
            if budget.expired() {
                return Ok(StageOutcome::TimedOut);
            }
            cancel.check()?;
            if *global_steps >= options.max_iters {
                return Ok(StageOutcome::IterCapped);
            }

            let tensors = param_tensors(params, mask, self.model);
            let (loss, breakdown) = ctx.composite(&tensors);

            if !breakdown.composite.is_finite() {
                return Err(FaceForgeError::DivergedNonFinite {
                    stage: stage_name.to_string(),
                });
            }

            if breakdown.composite < *stage_best - EARLY_STOP_MIN_DELTA {
                *stage_best = breakdown.composite;
                stale = 0;
            } else {
                *stage_best = stage_best.min(breakdown.composite);
                stale += 1;
            }
            if breakdown.composite < *best_loss {
                *best_loss = breakdown.composite;
                *best_params = params.clone();
            }
            if stale >= EARLY_STOP_PATIENCE {
                *converged = true;
                return Ok(StageOutcome::Completed);
            }

            let grads = loss.backward();
            let mut grad_vec = Vec::new();
            if mask.pose {
                let mut g = grad_of(&tensors.pose, &grads, 6);
                if options.freeze_jaw {
                    for v in g[3..6].iter_mut() {
                        *v = 0.0;
                    }
                }
                grad_vec.extend(g);
            }
            if mask.translation {
                grad_vec.extend(grad_of(&tensors.translation, &grads, 3));
            }
            if mask.scale {
                grad_vec.extend(grad_of(&tensors.scale, &grads, 1));
            }
            if mask.expression {
                grad_vec.extend(grad_of(&tensors.expression, &grads, params.expression.len()));
            }
            if mask.shape {
                grad_vec.extend(grad_of(&tensors.shape, &grads, params.shape.len()));
            }

            let mut values = gather(params, mask);
            adam.update(&mut values, &grad_vec);
            scatter(params, mask, &values);
            project(params, self.config, options.freeze_jaw);

            *global_steps += 1;
        }

        Ok(StageOutcome::Completed)
    }

    /// Rigid initialization: centroid alignment, extent-ratio scale, then
    /// point-to-point ICP on down-sampled clouds. The resulting transform is
    /// fixed for the whole fit.
    fn rigid_initialize(&self, cloud_points: &[Point3<f32>]) -> Result<(Prealign, f32)> {
        let template_points = self.model.neutral_vertices();
        let template = PointCloud::from_points(template_points);
        let cloud = PointCloud::from_points(cloud_points.to_vec());

        let c_src = template
            .centroid()
            .ok_or(FaceForgeError::EmptyInput("template vertices"))?;
        let c_tgt = cloud
            .centroid()
            .ok_or(FaceForgeError::EmptyInput("fit cloud"))?;

        let src_extent = template.mean_extent();
        if src_extent <= 0.0 {
            return Err(FaceForgeError::DegenerateGeometry(
                "template has zero extent".to_string(),
            ));
        }
        let scale = (cloud.mean_extent() / src_extent).clamp(SCALE_RANGE.0, SCALE_RANGE.1);

        let pre_aligned: Vec<Point3<f32>> = template
            .points
            .iter()
            .map(|p| Point3::from((p - c_src) * scale + c_tgt.coords))
            .collect();

        let source_down = voxel_downsample(
            &PointCloud::from_points(pre_aligned),
            ICP_VOXEL_SIZE,
        );
        let target_down = voxel_downsample(&cloud, ICP_VOXEL_SIZE);

        let prealign = match icp_rigid(
            &source_down.points,
            &target_down.points,
            ICP_MAX_DIST,
            ICP_MAX_ITER,
        ) {
            Ok(icp) => {
                debug!(
                    fitness = icp.fitness,
                    rmse = icp.inlier_rmse,
                    iterations = icp.iterations,
                    "icp pre-alignment"
                );
                let translation = (icp.rotation * (c_tgt.coords - c_src.coords * scale)
                    + icp.translation)
                    / scale;
                Prealign {
                    rotation: icp.rotation,
                    translation,
                }
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "icp pre-alignment failed, keeping centroid alignment");
                Prealign {
                    rotation: nalgebra::Matrix3::identity(),
                    translation: (c_tgt.coords - c_src.coords * scale) / scale,
                }
            }
            Err(err) => return Err(err),
        };

        Ok((prealign, scale))
    }
}

/// Projection onto the box constraints after every optimizer step.
fn project(params: &mut FlameParams, config: &FitConfig, freeze_jaw: bool) {
    for v in params.shape.iter_mut() {
        *v = v.clamp(-COEFF_LIMIT, COEFF_LIMIT);
    }
    for v in params.expression.iter_mut() {
        *v = v.clamp(-COEFF_LIMIT, COEFF_LIMIT);
    }
    for v in params.pose[0..3].iter_mut() {
        *v = v.clamp(-HEAD_POSE_LIMIT, HEAD_POSE_LIMIT);
    }
    for v in params.pose[3..6].iter_mut() {
        *v = if freeze_jaw {
            0.0
        } else {
            v.clamp(-config.jaw_max_rad, config.jaw_max_rad)
        };
    }
    params.scale = params.scale.clamp(SCALE_RANGE.0, SCALE_RANGE.1);
}

/// Build the step tensors, marking trainable groups for gradient tracking.
fn param_tensors(params: &FlameParams, mask: TrainMask, model: &FlameModel) -> ParamTensors {
    let device = model.device();
    let tensor1 = |data: Vec<f32>, trainable: bool| -> Tensor<B, 1> {
        let len = data.len();
        let t = Tensor::from_data(TensorData::new(data, [len]), device);
        if trainable {
            t.require_grad()
        } else {
            t
        }
    };
    let tensor2 = |data: Vec<f32>, cols: usize, trainable: bool| -> Tensor<B, 2> {
        let t = Tensor::from_data(TensorData::new(data, [1, cols]), device);
        if trainable {
            t.require_grad()
        } else {
            t
        }
    };

    ParamTensors {
        shape: tensor1(params.shape.clone(), mask.shape),
        expression: tensor1(params.expression.clone(), mask.expression),
        pose: tensor1(params.pose.clone(), mask.pose),
        scale: tensor2(vec![params.scale], 1, mask.scale),
        translation: tensor2(params.translation.to_vec(), 3, mask.translation),
    }
}

fn grad_of<const D: usize>(
    tensor: &Tensor<B, D>,
    grads: &<B as burn::tensor::backend::AutodiffBackend>::Gradients,
    len: usize,
) -> Vec<f32> {
    match tensor.grad(grads) {
        Some(g) => g
            .into_data()
            .to_vec::<f32>()
            .expect("gradient tensor is f32"),
        None => vec![0.0; len],
    }
}

fn gather(params: &FlameParams, mask: TrainMask) -> Vec<f32> {
    let mut out = Vec::new();
    if mask.pose {
        out.extend_from_slice(&params.pose);
    }
    if mask.translation {
        out.extend_from_slice(&params.translation);
    }
    if mask.scale {
        out.push(params.scale);
    }
    if mask.expression {
        out.extend_from_slice(&params.expression);
    }
    if mask.shape {
        out.extend_from_slice(&params.shape);
    }
    out
}

fn scatter(params: &mut FlameParams, mask: TrainMask, values: &[f32]) {
    let mut cursor = 0usize;
    let mut take = |n: usize| {
        let slice = &values[cursor..cursor + n];
        cursor += n;
        slice.to_vec()
    };
    if mask.pose {
        params.pose = take(6);
    }
    if mask.translation {
        let t = take(3);
        params.translation = [t[0], t[1], t[2]];
    }
    if mask.scale {
        params.scale = take(1)[0];
    }
    if mask.expression {
        params.expression = take(params.expression.len());
    }
    if mask.shape {
        params.shape = take(params.shape.len());
    }
}

/// Adam over a flat parameter vector; moments are reset per stage.
struct Adam {
    step: usize,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    fn new(len: usize) -> Self {
        Self {
            step: 0,
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    fn update(&mut self, values: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(values.len(), grads.len());
        self.step += 1;
        let bias1 = 1.0 - ADAM_BETA1.powi(self.step as i32);
        let bias2 = 1.0 - ADAM_BETA2.powi(self.step as i32);

        for i in 0..values.len() {
            self.m[i] = ADAM_BETA1 * self.m[i] + (1.0 - ADAM_BETA1) * grads[i];
            self.v[i] = ADAM_BETA2 * self.v[i] + (1.0 - ADAM_BETA2) * grads[i] * grads[i];
            let m_hat = self.m[i] / bias1;
            let v_hat = self.v[i] / bias2;
            values[i] -= ADAM_LR * m_hat / (v_hat.sqrt() + ADAM_EPS);
        }
    }
}
