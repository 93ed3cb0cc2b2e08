//! Face region crop
//!
//! Cheap pre-fit cropping in the scan frame: percentile bounds in x/y, the
//! near portion of the depth range, and a radial mask around the lateral
//! median. Conservative by design; when the mask would remove most of the
//! cloud it is skipped entirely.

use tracing::debug;

use crate::geometry::PointCloud;
use crate::metrics::percentile;

const XY_PERCENTILE_LOW: f64 = 10.0;
const XY_PERCENTILE_HIGH: f64 = 90.0;
/// Fraction of the depth range kept, measured from the near side.
const DEPTH_KEEP_FRACTION: f64 = 0.6;
/// Radial mask radius as a fraction of the larger lateral range.
const RADIAL_FRACTION: f64 = 0.6;
/// Below this keep-ratio the crop is skipped.
const MIN_KEEP_RATIO: f64 = 0.2;

/// Crop `cloud` to the probable face region (meters).
pub fn crop_face_region(cloud: &PointCloud) -> PointCloud {
    if cloud.len() < 16 {
        return cloud.clone();
    }

    let xs: Vec<f64> = cloud.points.iter().map(|p| p.x as f64).collect();
    let ys: Vec<f64> = cloud.points.iter().map(|p| p.y as f64).collect();
    let zs: Vec<f64> = cloud.points.iter().map(|p| p.z as f64).collect();

    let x_lo = percentile(&xs, XY_PERCENTILE_LOW);
    let x_hi = percentile(&xs, XY_PERCENTILE_HIGH);
    let y_lo = percentile(&ys, XY_PERCENTILE_LOW);
    let y_hi = percentile(&ys, XY_PERCENTILE_HIGH);

    let z_min = percentile(&zs, 0.0);
    let z_max = percentile(&zs, 100.0);
    let z_cut = z_min + DEPTH_KEEP_FRACTION * (z_max - z_min);

    let x_range = percentile(&xs, 100.0) - percentile(&xs, 0.0);
    let y_range = percentile(&ys, 100.0) - percentile(&ys, 0.0);
    let radius = RADIAL_FRACTION * x_range.max(y_range);
    let cx = percentile(&xs, 50.0);
    let cy = percentile(&ys, 50.0);

    let kept: Vec<usize> = cloud
        .points
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            let x = p.x as f64;
            let y = p.y as f64;
            let z = p.z as f64;
            x >= x_lo
                && x <= x_hi
                && y >= y_lo
                && y <= y_hi
                && z <= z_cut
                && ((x - cx).powi(2) + (y - cy).powi(2)).sqrt() <= radius
        })
        .map(|(i, _)| i)
        .collect();

    let keep_ratio = kept.len() as f64 / cloud.len() as f64;
    if keep_ratio < MIN_KEEP_RATIO {
        debug!(keep_ratio, "face crop kept too little, skipping");
        return cloud.clone();
    }

    debug!(
        kept = kept.len(),
        total = cloud.len(),
        "face region crop"
    );
    cloud.select(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn keeps_central_blob_drops_fringe() {
        let mut points = Vec::new();
        // Dense face-like blob at the front.
        for x in -20..=20 {
            for y in -20..=20 {
                points.push(Point3::new(x as f32 * 0.005, y as f32 * 0.005, 0.3));
            }
        }
        // Background plane far behind.
        for x in -10..=10 {
            for y in -10..=10 {
                points.push(Point3::new(x as f32 * 0.02, y as f32 * 0.02, 1.5));
            }
        }
        let cloud = PointCloud::from_points(points);
        let cropped = crop_face_region(&cloud);
        assert!(cropped.len() < cloud.len());
        assert!(cropped.points.iter().all(|p| p.z < 1.0));
    }

    #[test]
    fn skips_when_mask_too_aggressive() {
        // Almost everything at one depth plane far from the median lateral
        // center: the radial mask would keep nearly nothing.
        let mut points = vec![Point3::new(0.0, 0.0, 0.0); 4];
        for i in 0..100 {
            let angle = i as f32 * 0.0628;
            points.push(Point3::new(angle.cos() * 10.0, angle.sin() * 10.0, 5.0));
        }
        let cloud = PointCloud::from_points(points);
        let cropped = crop_face_region(&cloud);
        // Ring points survive because the crop was skipped.
        assert_eq!(cropped.len(), cloud.len());
    }

    #[test]
    fn tiny_clouds_pass_through() {
        let cloud = PointCloud::from_points(vec![Point3::new(0.0, 0.0, 0.0); 5]);
        assert_eq!(crop_face_region(&cloud).len(), 5);
    }
}
