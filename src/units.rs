//! Unit normalization
//!
//! Scans arrive with no declared unit; infer it from the bounding-box
//! diagonal. A face-sized scan spans roughly 0.15-0.35 meters, so anything
//! past 1.0 is assumed to be millimeters and anything under 0.02 is suspect.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geometry::PointCloud;

pub const WARN_UNIT_SUSPECT: &str = "UNIT_SUSPECT";
pub const WARN_POINTCLOUD_EMPTY: &str = "POINTCLOUD_EMPTY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitLabel {
    Meters,
    Millimeters,
    Unknown,
    Override,
}

impl UnitLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitLabel::Meters => "meters",
            UnitLabel::Millimeters => "millimeters",
            UnitLabel::Unknown => "unknown",
            UnitLabel::Override => "override",
        }
    }
}

/// Outcome of unit normalization.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub cloud: PointCloud,
    pub units_inferred: UnitLabel,
    pub unit_scale_applied: f32,
    pub warnings: Vec<String>,
}

/// Scale `cloud` into meters.
///
/// `override_scale` takes precedence over `override_units`, which takes
/// precedence over the heuristic.
pub fn normalize_units(
    cloud: PointCloud,
    override_scale: Option<f32>,
    override_units: Option<UnitLabel>,
) -> UnitResult {
    let mut warnings = Vec::new();

    if cloud.is_empty() {
        warnings.push(WARN_POINTCLOUD_EMPTY.to_string());
        return UnitResult {
            cloud,
            units_inferred: UnitLabel::Unknown,
            unit_scale_applied: 1.0,
            warnings,
        };
    }

    let diag = cloud.bbox_diagonal();

    let (units_inferred, scale) = if let Some(s) = override_scale.filter(|&s| s > 0.0) {
        (UnitLabel::Override, s)
    } else if let Some(units) = override_units {
        match units {
            UnitLabel::Millimeters => (UnitLabel::Millimeters, 1e-3),
            UnitLabel::Meters => (UnitLabel::Meters, 1.0),
            other => (other, 1.0),
        }
    } else if diag > 1.0 {
        (UnitLabel::Millimeters, 1e-3)
    } else if diag < 0.02 {
        warnings.push(WARN_UNIT_SUSPECT.to_string());
        (UnitLabel::Unknown, 1.0)
    } else {
        (UnitLabel::Meters, 1.0)
    };

    info!(
        diag,
        units = units_inferred.as_str(),
        scale,
        "unit normalization"
    );

    let cloud = if scale != 1.0 {
        cloud.scaled(scale)
    } else {
        cloud
    };

    UnitResult {
        cloud,
        units_inferred,
        unit_scale_applied: scale,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn cloud_with_diag(diag: f32) -> PointCloud {
        let side = diag / 3.0f32.sqrt();
        PointCloud::from_points(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(side, side, side),
        ])
    }

    #[test]
    fn millimeter_cloud_detected() {
        let result = normalize_units(cloud_with_diag(1.7), None, None);
        assert_eq!(result.units_inferred, UnitLabel::Millimeters);
        assert_eq!(result.unit_scale_applied, 1e-3);
        let scaled_diag = result.cloud.bbox_diagonal();
        assert!((scaled_diag - 0.0017).abs() < 1e-6);
    }

    #[test]
    fn face_sized_cloud_kept_as_meters() {
        let result = normalize_units(cloud_with_diag(0.2), None, None);
        assert_eq!(result.units_inferred, UnitLabel::Meters);
        assert_eq!(result.unit_scale_applied, 1.0);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn tiny_cloud_is_suspect() {
        let result = normalize_units(cloud_with_diag(0.01), None, None);
        assert_eq!(result.units_inferred, UnitLabel::Unknown);
        assert!(result.warnings.iter().any(|w| w == WARN_UNIT_SUSPECT));
    }

    #[test]
    fn override_scale_wins() {
        let result = normalize_units(cloud_with_diag(1.7), Some(0.5), Some(UnitLabel::Meters));
        assert_eq!(result.units_inferred, UnitLabel::Override);
        assert_eq!(result.unit_scale_applied, 0.5);
    }

    #[test]
    fn empty_cloud_warns() {
        let result = normalize_units(PointCloud::default(), None, None);
        assert!(result.warnings.iter().any(|w| w == WARN_POINTCLOUD_EMPTY));
    }
}
