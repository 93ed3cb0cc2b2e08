//! Repeatability check
//!
//! Run the same fit several times and report the spread of the nose-tip
//! landmark. With a fixed seed the pipeline is deterministic, so any spread
//! indicates nondeterminism leaking in (thread scheduling, uninitialized
//! state).

use nalgebra::{Point3, Vector3};

use super::{FitPipeline, JobOptions};
use crate::error::Result;
use crate::geometry::PointCloud;
use crate::landmarks::NOSE_TIP_INDEX;

/// Fit `cloud` `runs` times and return the nose-tip standard deviation in
/// millimeters.
pub fn repeatability_check(
    pipeline: &FitPipeline<'_>,
    cloud: &PointCloud,
    options: &JobOptions,
    runs: usize,
) -> Result<f64> {
    let mut nose_positions: Vec<Point3<f32>> = Vec::with_capacity(runs);
    for _ in 0..runs.max(1) {
        let outcome = pipeline.run(cloud.clone(), options)?;
        let idx = NOSE_TIP_INDEX.min(outcome.landmarks.len().saturating_sub(1));
        nose_positions.push(outcome.landmarks[idx]);
    }

    let n = nose_positions.len() as f32;
    let mean = nose_positions
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p.coords)
        / n;
    let variance = nose_positions
        .iter()
        .map(|p| (p.coords - mean).map(|c| c * c))
        .fold(Vector3::zeros(), |acc: Vector3<f32>, v| acc + v)
        / n;
    let std = variance.map(|c| c.sqrt());

    Ok(std.norm() as f64 * 1000.0)
}
