//! Polar measurement conversion
//!
//! # Local frame convention
//!
//! The anchor's local frame is right-handed and planar:
//!
//! ```text
//!          +y (forward, primary measurement axis)
//!           |
//!           |   angle > 0 turns towards -x
//!           |
//!   --------A-------- +x (right)
//! ```
//!
//! The reported angle is measured from +y, positive counter-clockwise, so
//!
//! ```text
//! x = -d * sin(angle)
//! y =  d * cos(angle)
//! ```
//!
//! Every consumer of [`crate::TrackState`] position and velocity uses this
//! frame; [`crate::transform`] maps it onto the map frame.

use serde::{Deserialize, Serialize};

/// Largest magnitude of a valid angle reading, in hundredths of a degree
pub const MAX_ANGLE_CENTIDEGREES: i32 = 18_000;

/// Raw polar reading as reported by the anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolarMeasurement {
    pub distance_mm: i32,
    pub angle_centidegrees: i16,
}

impl PolarMeasurement {
    pub fn new(distance_mm: i32, angle_centidegrees: i16) -> Self {
        Self {
            distance_mm,
            angle_centidegrees,
        }
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_mm as f64 / 1000.0
    }

    pub fn angle_deg(&self) -> f64 {
        self.angle_centidegrees as f64 / 100.0
    }

    pub fn angle_rad(&self) -> f64 {
        self.angle_deg().to_radians()
    }

    /// Local Cartesian position in metres
    pub fn to_local(&self) -> (f64, f64) {
        polar_to_local(self.distance_m(), self.angle_rad())
    }
}

/// Convert distance (m) and angle (rad) into local `(x, y)`
#[inline]
pub fn polar_to_local(distance_m: f64, angle_rad: f64) -> (f64, f64) {
    let (sin, cos) = angle_rad.sin_cos();
    (-distance_m * sin, distance_m * cos)
}

/// Convert local `(x, y)` back into distance (m) and angle (rad)
#[inline]
pub fn local_to_polar(x: f64, y: f64) -> (f64, f64) {
    (x.hypot(y), (-x).atan2(y))
}

/// Signed difference `a - b` between two angles in degrees, wrapped to [-180, 180]
pub fn angle_delta_deg(a: f64, b: f64) -> f64 {
    let mut delta = (a - b) % 360.0;
    if delta > 180.0 {
        delta -= 360.0;
    } else if delta < -180.0 {
        delta += 360.0;
    }
    delta
}
