//! Barycentric landmark embedding
//!
//! Landmarks are fixed `(face, barycentric)` pairs over the template
//! topology; evaluation is a linear map of the current vertices, so it is
//! differentiable for free and stays valid under deformation.

use burn::tensor::{Int, Tensor};
use nalgebra::Point3;

use crate::error::{FaceForgeError, Result};
use crate::model::assets::LandmarkEmbeddingAsset;
use crate::model::flame::indices_to_tensor;
use crate::model::{FitBackend, FitDevice};

type B = FitBackend;

/// Index of the nose-tip landmark in the embedding order.
pub const NOSE_TIP_INDEX: usize = 1;

/// Landmark indices treated as mouth region for loss upweighting. Indices
/// beyond the embedding length are ignored.
pub const MOUTH_LANDMARK_INDICES: [usize; 8] = [0, 13, 14, 17, 61, 78, 291, 308];

/// A topology-bound landmark embedding: per landmark, the three vertex
/// indices of its triangle and the barycentric weights.
#[derive(Debug, Clone)]
pub struct LandmarkEmbedding {
    vertex_idx: Vec<[u32; 3]>,
    weights: Vec<[f32; 3]>,
}

impl LandmarkEmbedding {
    /// Resolve a raw `(face_idx, bary)` asset against the template faces.
    ///
    /// Weights must be non-negative and sum to 1 within tolerance.
    pub fn from_asset(asset: &LandmarkEmbeddingAsset, faces: &[[u32; 3]]) -> Result<Self> {
        let mut vertex_idx = Vec::with_capacity(asset.face_idx.len());
        let mut weights = Vec::with_capacity(asset.face_idx.len());

        for (j, (&face, bary)) in asset.face_idx.iter().zip(&asset.bary).enumerate() {
            let face = faces.get(face as usize).ok_or_else(|| {
                FaceForgeError::AssetLoad(format!(
                    "landmark {} references face {} of {}",
                    j,
                    face,
                    faces.len()
                ))
            })?;
            let sum: f32 = bary.iter().sum();
            if bary.iter().any(|&w| w < -1e-5) || (sum - 1.0).abs() > 1e-3 {
                return Err(FaceForgeError::AssetLoad(format!(
                    "landmark {} barycentric weights invalid: {:?}",
                    j, bary
                )));
            }
            vertex_idx.push(*face);
            weights.push(*bary);
        }

        Ok(Self {
            vertex_idx,
            weights,
        })
    }

    pub fn len(&self) -> usize {
        self.vertex_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_idx.is_empty()
    }

    /// Evaluate landmark positions against plain vertices.
    pub fn evaluate(&self, vertices: &[Point3<f32>]) -> Vec<Point3<f32>> {
        self.vertex_idx
            .iter()
            .zip(&self.weights)
            .map(|(tri, w)| {
                let a = vertices[tri[0] as usize].coords * w[0];
                let b = vertices[tri[1] as usize].coords * w[1];
                let c = vertices[tri[2] as usize].coords * w[2];
                Point3::from(a + b + c)
            })
            .collect()
    }

    /// Mouth landmark indices present in this embedding.
    pub fn mouth_indices(&self) -> Vec<usize> {
        MOUTH_LANDMARK_INDICES
            .iter()
            .copied()
            .filter(|&i| i < self.len())
            .collect()
    }
}

/// Tensor-side landmark evaluation: three gathers and a weighted sum, no
/// per-landmark loop.
pub struct LandmarkEvaluator {
    idx: [Tensor<B, 1, Int>; 3],
    weights: [Tensor<B, 2>; 3],
    len: usize,
}

impl LandmarkEvaluator {
    pub fn new(embedding: &LandmarkEmbedding, device: &FitDevice) -> Self {
        let column = |corner: usize| -> (Tensor<B, 1, Int>, Tensor<B, 2>) {
            let indices: Vec<usize> = embedding
                .vertex_idx
                .iter()
                .map(|tri| tri[corner] as usize)
                .collect();
            let weights: Vec<f32> = embedding.weights.iter().map(|w| w[corner]).collect();
            let n = weights.len();
            let weight_tensor = Tensor::from_data(
                burn::tensor::TensorData::new(weights, [n, 1]),
                device,
            );
            (indices_to_tensor(&indices, device), weight_tensor)
        };

        let (i0, w0) = column(0);
        let (i1, w1) = column(1);
        let (i2, w2) = column(2);
        Self {
            idx: [i0, i1, i2],
            weights: [w0, w1, w2],
            len: embedding.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `[L, 3]` landmark positions as a linear map of `vertices`.
    pub fn evaluate(&self, vertices: Tensor<B, 2>) -> Tensor<B, 2> {
        vertices.clone().select(0, self.idx[0].clone()) * self.weights[0].clone()
            + vertices.clone().select(0, self.idx[1].clone()) * self.weights[1].clone()
            + vertices.select(0, self.idx[2].clone()) * self.weights[2].clone()
    }
}
