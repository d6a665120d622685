//! Local anchor frame to map frame
//!
//! All functions here are pure. The carrier pose places the anchor origin at
//! `(x, y)` in the map frame with its local +x axis rotated by `theta`.

use crate::target::{TagId, TrackState};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Default speed below which a heading is flagged unreliable (m/s)
pub const DEFAULT_MIN_HEADING_SPEED: f64 = 0.1;

/// Carrier pose in the map frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Heading in radians
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
}

/// Map `(local_x, local_y)` into the map frame
#[inline]
pub fn transform(local_x: f64, local_y: f64, pose: &Pose) -> (f64, f64) {
    let (sin, cos) = pose.theta.sin_cos();
    (
        pose.x + local_x * cos - local_y * sin,
        pose.y + local_x * sin + local_y * cos,
    )
}

/// Map a map-frame point back into the local frame of `pose`
#[inline]
pub fn inverse_transform(global_x: f64, global_y: f64, pose: &Pose) -> (f64, f64) {
    let (sin, cos) = pose.theta.sin_cos();
    let dx = global_x - pose.x;
    let dy = global_y - pose.y;
    (dx * cos + dy * sin, -dx * sin + dy * cos)
}

/// Rotate a free vector (velocity) by `theta`
#[inline]
pub fn rotate(vx: f64, vy: f64, theta: f64) -> (f64, f64) {
    let (sin, cos) = theta.sin_cos();
    (vx * cos - vy * sin, vx * sin + vy * cos)
}

/// Wrap an angle into (-π, π]
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI {
        wrapped - TAU
    } else {
        wrapped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadingEstimate {
    /// Direction of travel in the map frame, radians in (-π, π]
    pub heading: f64,
    /// False when the target moves too slowly for its velocity to mean anything
    pub reliable: bool,
}

/// Direction of travel in the map frame from a local-frame velocity
pub fn estimate_heading(vx: f64, vy: f64, pose: &Pose, min_speed: f64) -> HeadingEstimate {
    let local_heading = vy.atan2(vx);
    HeadingEstimate {
        heading: normalize_angle(pose.theta + local_heading),
        reliable: vx.hypot(vy) >= min_speed,
    }
}

/// A tag's filtered position expressed in the map frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GlobalPosition {
    pub tag_id: TagId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub heading: HeadingEstimate,
    pub confidence: f64,
    pub timestamp: f64,
    /// False when projected from an unfiltered reading
    pub filtered: bool,
}

/// Project a track into the map frame through `pose`
pub fn project(
    track: &TrackState,
    pose: &Pose,
    timestamp: f64,
    min_heading_speed: f64,
) -> GlobalPosition {
    let (x, y) = transform(track.x, track.y, pose);
    let (vx, vy) = rotate(track.vx, track.vy, pose.theta);
    GlobalPosition {
        tag_id: track.tag_id,
        x,
        y,
        vx,
        vy,
        heading: estimate_heading(track.vx, track.vy, pose, min_heading_speed),
        confidence: track.confidence,
        timestamp,
        filtered: track.filtered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix4;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_quarter_turn() {
        let pose = Pose::new(10.0, 20.0, FRAC_PI_2);
        let (x, y) = transform(1.0, 0.0, &pose);
        assert_abs_diff_eq!(x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 21.0, epsilon = 1e-9);
    }

    #[test]
    fn test_origin_maps_to_pose() {
        let pose = Pose::new(-3.5, 7.25, 2.2);
        assert_eq!(transform(0.0, 0.0, &pose), (pose.x, pose.y));
    }

    #[test]
    fn test_round_trip_and_distance() {
        let poses = [
            Pose::new(0.0, 0.0, 0.0),
            Pose::new(10.0, -4.0, 1.3),
            Pose::new(-250.0, 80.0, -3.1),
        ];
        let points = [(1.0, 2.0), (-0.3, 5.5), (40.0, -12.0)];
        for pose in &poses {
            for &(lx, ly) in &points {
                let (gx, gy) = transform(lx, ly, pose);
                let (bx, by) = inverse_transform(gx, gy, pose);
                assert_abs_diff_eq!(bx, lx, epsilon = 1e-6);
                assert_abs_diff_eq!(by, ly, epsilon = 1e-6);

                let local_range = lx.hypot(ly);
                let global_range = (gx - pose.x).hypot(gy - pose.y);
                assert_abs_diff_eq!(local_range, global_range, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_normalize_angle() {
        assert_abs_diff_eq!(normalize_angle(3.0 * PI), PI, epsilon = 1e-9);
        assert_abs_diff_eq!(normalize_angle(-PI), PI, epsilon = 1e-9);
        assert_abs_diff_eq!(normalize_angle(-FRAC_PI_2), -FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(TAU + 0.25), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_heading() {
        let pose = Pose::new(0.0, 0.0, FRAC_PI_2);
        let moving = estimate_heading(0.5, 0.0, &pose, DEFAULT_MIN_HEADING_SPEED);
        assert!(moving.reliable);
        assert_abs_diff_eq!(moving.heading, FRAC_PI_2, epsilon = 1e-12);

        let still = estimate_heading(0.01, 0.02, &pose, DEFAULT_MIN_HEADING_SPEED);
        assert!(!still.reliable);
    }

    #[test]
    fn test_project_track() {
        let track = TrackState {
            tag_id: 5,
            x: 1.0,
            y: 0.0,
            vx: 0.0,
            vy: 1.0,
            covariance: Matrix4::identity() * 0.01,
            confidence: 0.7,
            initialized: true,
            last_update_time: 3.0,
            update_count: 8,
            filtered: true,
        };
        let pose = Pose::new(10.0, 20.0, FRAC_PI_2);
        let global = project(&track, &pose, 3.0, DEFAULT_MIN_HEADING_SPEED);

        assert_eq!(global.tag_id, 5);
        assert_abs_diff_eq!(global.x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(global.y, 21.0, epsilon = 1e-9);
        // Local +y rotated a quarter turn points along map -x
        assert_abs_diff_eq!(global.vx, -1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(global.vy, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(global.confidence, 0.7);
        assert!(global.heading.reliable);
        assert!(global.filtered);
    }

    #[test]
    fn test_pose_validation() {
        assert!(Pose::new(1.0, 2.0, 0.3).is_finite());
        assert!(!Pose::new(f64::NAN, 2.0, 0.3).is_finite());
        assert!(!Pose::new(1.0, 2.0, f64::INFINITY).is_finite());
    }
}
