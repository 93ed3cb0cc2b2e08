//! JSON artifacts
//!
//! Landmark and diagnostics writers. Landmarks are meters, row per landmark.

use std::fs;
use std::path::Path;

use nalgebra::Point3;
use serde::Serialize;
use serde_json::json;

use crate::error::Result;

/// Write `{ "landmarks": [[x, y, z], ...] }`.
pub fn write_landmarks_json<P: AsRef<Path>>(path: P, landmarks: &[Point3<f32>]) -> Result<()> {
    let rows: Vec<[f32; 3]> = landmarks.iter().map(|p| [p.x, p.y, p.z]).collect();
    let value = json!({ "landmarks": rows });
    fs::write(path, serde_json::to_vec_pretty(&value)?)?;
    Ok(())
}

/// Write any serializable diagnostics bundle as pretty JSON.
pub fn write_json_pretty<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}
