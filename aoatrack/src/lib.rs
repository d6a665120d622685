//! Pure Rust tracking library for angle-of-arrival ranging tags
//!
//! Turns raw polar readings (distance + angle of arrival) reported by an
//! anchor into smoothed per-tag Cartesian tracks, and projects those tracks
//! into a map frame through the carrier pose. No threads, no I/O.
//!
//! ```rust,ignore
//! use aoatrack::{project, Pose, TargetTracker, TrackerConfig, DEFAULT_MIN_HEADING_SPEED};
//!
//! let tracker = TargetTracker::new(TrackerConfig::default());
//! tracker.ingest(1, 1500, -2500, 0.0);
//!
//! if let Some(track) = tracker.get_state(1) {
//!     let pose = Pose::new(10.0, 20.0, 0.0);
//!     let global = project(&track, &pose, 0.0, DEFAULT_MIN_HEADING_SPEED);
//!     println!("tag {} at ({:.2}, {:.2})", global.tag_id, global.x, global.y);
//! }
//! ```

pub mod kalman;
pub mod measurement;
pub mod target;
pub mod transform;

pub use kalman::{KalmanFilter, KalmanFilterParams};
pub use measurement::{local_to_polar, polar_to_local, PolarMeasurement};
pub use target::{
    IngestOutcome, RejectReason, TagId, TargetTracker, TrackState, TrackerConfig, TrackerCounters,
};
pub use transform::{
    estimate_heading, inverse_transform, normalize_angle, project, rotate, transform,
    GlobalPosition, HeadingEstimate, Pose, DEFAULT_MIN_HEADING_SPEED,
};
