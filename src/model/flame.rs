//! Differentiable model evaluation
//!
//! Blendshape offsets are linear in the identity and expression
//! coefficients; the jaw rotates a weighted vertex region about its pivot and
//! the head rotation acts globally. Everything is expressed as tensor ops so
//! the reverse-mode tape reaches back to the coefficients.

use burn::tensor::{Int, Tensor, TensorData};
use nalgebra::Point3;

use super::{assets::FlameAsset, FitBackend, FitDevice};

type B = FitBackend;

/// Rodrigues rotation built on-tape from an axis-angle vector of length 3.
///
/// The angle is regularized with a small epsilon so the zero rotation has a
/// finite gradient.
pub fn rodrigues(axis_angle: Tensor<B, 1>, device: &FitDevice) -> Tensor<B, 2> {
    let theta = axis_angle
        .clone()
        .powf_scalar(2.0)
        .sum()
        .add_scalar(1e-12)
        .sqrt();
    let k = axis_angle / theta.clone();

    let kx = k.clone().slice([0..1]);
    let ky = k.clone().slice([1..2]);
    let kz = k.slice([2..3]);
    let zero = Tensor::<B, 1>::zeros([1], device);

    let row0 = Tensor::cat(vec![zero.clone(), kz.clone().neg(), ky.clone()], 0);
    let row1 = Tensor::cat(vec![kz, zero.clone(), kx.clone().neg()], 0);
    let row2 = Tensor::cat(vec![ky.neg(), kx, zero], 0);
    let k_mat: Tensor<B, 2> = Tensor::stack(vec![row0, row1, row2], 0);

    let sin_t: Tensor<B, 2> = theta.clone().sin().unsqueeze_dim(1);
    let one_minus_cos: Tensor<B, 2> = theta.cos().neg().add_scalar(1.0).unsqueeze_dim(1);

    let eye = identity3(device);
    eye + k_mat.clone() * sin_t + k_mat.clone().matmul(k_mat) * one_minus_cos
}

fn identity3(device: &FitDevice) -> Tensor<B, 2> {
    Tensor::from_data(
        TensorData::new(
            vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            [3, 3],
        ),
        device,
    )
}

/// The loaded model operator: constant tensors for the template and bases,
/// plus topology.
pub struct FlameModel {
    template: Tensor<B, 2>,    // [V, 3]
    shapedirs: Tensor<B, 2>,   // [3V, n_shape]
    expdirs: Tensor<B, 2>,     // [3V, n_expr]
    jaw_weights: Tensor<B, 2>, // [V, 1]
    jaw_pivot: Tensor<B, 2>,   // [1, 3]
    has_jaw: bool,
    faces: Vec<[u32; 3]>,
    n_vertices: usize,
    n_shape: usize,
    n_expr: usize,
    device: FitDevice,
}

impl FlameModel {
    pub fn from_asset(asset: &FlameAsset, device: &FitDevice) -> Self {
        let n = asset.n_vertices;
        let template = Tensor::from_data(
            TensorData::new(asset.v_template.clone(), [n, 3]),
            device,
        );
        let shapedirs = Tensor::from_data(
            TensorData::new(asset.shapedirs.clone(), [3 * n, asset.n_shape]),
            device,
        );
        let expdirs = Tensor::from_data(
            TensorData::new(asset.expdirs.clone(), [3 * n, asset.n_expr]),
            device,
        );
        let jaw_weights = Tensor::from_data(
            TensorData::new(asset.jaw_weights.clone(), [n, 1]),
            device,
        );
        let jaw_pivot = Tensor::from_data(
            TensorData::new(asset.jaw_pivot.to_vec(), [1, 3]),
            device,
        );
        let has_jaw = asset.jaw_weights.iter().any(|&w| w != 0.0);

        Self {
            template,
            shapedirs,
            expdirs,
            jaw_weights,
            jaw_pivot,
            has_jaw,
            faces: asset.faces.clone(),
            n_vertices: n,
            n_shape: asset.n_shape,
            n_expr: asset.n_expr,
            device: *device,
        }
    }

    pub fn n_vertices(&self) -> usize {
        self.n_vertices
    }

    pub fn n_shape(&self) -> usize {
        self.n_shape
    }

    pub fn n_expr(&self) -> usize {
        self.n_expr
    }

    pub fn faces(&self) -> &[[u32; 3]] {
        &self.faces
    }

    pub fn device(&self) -> &FitDevice {
        &self.device
    }

    /// Evaluate the model: `(shape, expression, pose)` → vertices `[V, 3]`.
    ///
    /// `pose` is head rotation (3) ⊕ jaw rotation (3), axis-angle.
    pub fn evaluate(
        &self,
        shape: Tensor<B, 1>,
        expression: Tensor<B, 1>,
        pose: Tensor<B, 1>,
    ) -> Tensor<B, 2> {
        let shape_col: Tensor<B, 2> = shape.unsqueeze_dim(1);
        let expr_col: Tensor<B, 2> = expression.unsqueeze_dim(1);

        let shape_offsets = self
            .shapedirs
            .clone()
            .matmul(shape_col)
            .reshape([self.n_vertices, 3]);
        let expr_offsets = self
            .expdirs
            .clone()
            .matmul(expr_col)
            .reshape([self.n_vertices, 3]);

        let mut vertices = self.template.clone() + shape_offsets + expr_offsets;

        if self.has_jaw {
            let r_jaw = rodrigues(pose.clone().slice([3..6]), &self.device);
            let centered = vertices.clone() - self.jaw_pivot.clone();
            let rotated = centered.matmul(r_jaw.transpose()) + self.jaw_pivot.clone();
            let delta = rotated - vertices.clone();
            vertices = vertices + delta * self.jaw_weights.clone();
        }

        let r_head = rodrigues(pose.slice([0..3]), &self.device);
        vertices.matmul(r_head.transpose())
    }

    /// Neutral vertices as plain points (zero coefficients, detached).
    pub fn neutral_vertices(&self) -> Vec<Point3<f32>> {
        let data = self
            .template
            .clone()
            .into_data()
            .to_vec::<f32>()
            .expect("template tensor is f32");
        data.chunks_exact(3)
            .map(|c| Point3::new(c[0], c[1], c[2]))
            .collect()
    }
}

/// Read a `[N, 3]` vertex tensor back into points.
pub fn tensor_to_points(tensor: Tensor<B, 2>) -> Vec<Point3<f32>> {
    let data = tensor
        .into_data()
        .to_vec::<f32>()
        .expect("vertex tensor is f32");
    data.chunks_exact(3)
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect()
}

/// Build a constant `[N, 3]` tensor from points.
pub fn points_to_tensor(points: &[Point3<f32>], device: &FitDevice) -> Tensor<B, 2> {
    let mut flat = Vec::with_capacity(points.len() * 3);
    for p in points {
        flat.extend_from_slice(&[p.x, p.y, p.z]);
    }
    Tensor::from_data(TensorData::new(flat, [points.len(), 3]), device)
}

/// Build a constant index tensor.
pub fn indices_to_tensor(indices: &[usize], device: &FitDevice) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    let len = data.len();
    Tensor::from_data(TensorData::new(data, [len]), device)
}
