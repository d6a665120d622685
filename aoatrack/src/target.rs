//! Per-tag Kalman filter bank
//!
//! Each tag id owns one constant-velocity filter that is created lazily on the
//! first accepted measurement. The tag map is guarded by a single lock that is
//! only held for lookup and insertion; the filter math of a tag runs under that
//! tag's own lock.

use crate::kalman::{KalmanFilter, KalmanFilterParams};
use crate::measurement::{angle_delta_deg, PolarMeasurement, MAX_ANGLE_CENTIDEGREES};
use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tag identifier as carried in the protocol frame
pub type TagId = u8;

/// Tuning of the per-tag filters and the measurement gates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Acceleration variance of the constant-velocity model ((m/s²)²)
    pub process_noise: f64,
    /// Standard deviation of a converted position measurement (m)
    pub measurement_noise_std: f64,
    /// Velocity variance of a freshly created track ((m/s)²)
    pub initial_velocity_variance: f64,
    /// Upper bound on the prediction step (s)
    pub max_dt: f64,
    /// Accepted measurements before a track reports `initialized`
    pub min_updates: u32,
    /// A track also counts as initialized once trace(P_pos) drops below this (m²)
    pub init_trace_threshold: f64,
    /// Position variance that maps to confidence 0.5 (m²)
    pub confidence_reference_variance: f64,
    /// Largest plausible distance reading (mm)
    pub max_range_mm: i32,
    /// Angle change that is rejected as a glitch within `stale_reset_s` (degrees)
    pub angle_jump_threshold_deg: f64,
    /// Gates only compare against measurements younger than this (s)
    pub stale_reset_s: f64,
    /// Filtered speed above this is capped and lowers confidence (m/s)
    pub max_speed_mps: f64,
    /// Snapshots kept per tag for [`TargetTracker::state_at`]; 0 keeps none
    pub history_len: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.2,
            measurement_noise_std: 0.1,
            initial_velocity_variance: 1.0,
            max_dt: 1.0,
            min_updates: 3,
            init_trace_threshold: 0.005,
            confidence_reference_variance: 0.02,
            max_range_mm: 100_000,
            angle_jump_threshold_deg: 90.0,
            stale_reset_s: 0.8,
            max_speed_mps: 5.0,
            history_len: 200,
        }
    }
}

impl TrackerConfig {
    /// Check that every parameter is usable by the filter
    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("process_noise", self.process_noise),
            ("measurement_noise_std", self.measurement_noise_std),
            ("initial_velocity_variance", self.initial_velocity_variance),
            ("max_dt", self.max_dt),
            (
                "confidence_reference_variance",
                self.confidence_reference_variance,
            ),
            ("stale_reset_s", self.stale_reset_s),
            ("max_speed_mps", self.max_speed_mps),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{} must be positive, got {}", name, value));
            }
        }
        if self.max_range_mm <= 0 {
            return Err(format!("max_range_mm must be positive, got {}", self.max_range_mm));
        }
        if !(self.angle_jump_threshold_deg > 0.0 && self.angle_jump_threshold_deg <= 180.0) {
            return Err(format!(
                "angle_jump_threshold_deg must be in (0, 180], got {}",
                self.angle_jump_threshold_deg
            ));
        }
        Ok(())
    }
}

/// Why a measurement was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// Distance or angle outside the sensor's range
    OutOfRange,
    /// Timestamp is NaN or infinite
    InvalidTimestamp,
    /// Angle moved further than the jump threshold since the last measurement
    AngleJump,
}

/// Result of [`TargetTracker::ingest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First measurement of a new tag; a track was created
    Created,
    /// Existing track predicted and corrected
    Updated,
    /// Measurement dropped, the track is unchanged
    Rejected(RejectReason),
    /// Correction step was numerically impossible; the track kept its prediction
    Degenerate,
}

/// Snapshot of one tag's filtered state in the anchor frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackState {
    pub tag_id: TagId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    /// Covariance of `[x, y, vx, vy]`
    pub covariance: Matrix4<f64>,
    /// 1.0 = fully trusted, 0.0 = no information
    pub confidence: f64,
    pub initialized: bool,
    /// Timestamp of the last accepted measurement (s)
    pub last_update_time: f64,
    pub update_count: u32,
    /// False for a raw reading converted with filtering switched off
    pub filtered: bool,
}

impl TrackState {
    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.vx, self.vy)
    }

    pub fn speed(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    /// Position `horizon` seconds ahead under the constant-velocity model
    pub fn extrapolate(&self, horizon: f64) -> (f64, f64) {
        (self.x + self.vx * horizon, self.y + self.vy * horizon)
    }
}

/// Cumulative tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerCounters {
    pub accepted: u64,
    pub rejected_out_of_range: u64,
    pub rejected_invalid_timestamp: u64,
    pub rejected_angle_jump: u64,
    /// Accepted updates whose filtered speed had to be capped
    pub speed_capped: u64,
    pub degenerate_updates: u64,
}

impl TrackerCounters {
    pub fn rejected(&self) -> u64 {
        self.rejected_out_of_range
            + self.rejected_invalid_timestamp
            + self.rejected_angle_jump
    }
}

#[derive(Debug, Default)]
struct AtomicCounters {
    accepted: AtomicU64,
    rejected_out_of_range: AtomicU64,
    rejected_invalid_timestamp: AtomicU64,
    rejected_angle_jump: AtomicU64,
    speed_capped: AtomicU64,
    degenerate_updates: AtomicU64,
}

impl AtomicCounters {
    fn reject(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::OutOfRange => &self.rejected_out_of_range,
            RejectReason::InvalidTimestamp => &self.rejected_invalid_timestamp,
            RejectReason::AngleJump => &self.rejected_angle_jump,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TrackerCounters {
        TrackerCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_out_of_range: self.rejected_out_of_range.load(Ordering::Relaxed),
            rejected_invalid_timestamp: self.rejected_invalid_timestamp.load(Ordering::Relaxed),
            rejected_angle_jump: self.rejected_angle_jump.load(Ordering::Relaxed),
            speed_capped: self.speed_capped.load(Ordering::Relaxed),
            degenerate_updates: self.degenerate_updates.load(Ordering::Relaxed),
        }
    }
}

/// Last accepted raw measurement, used by the angle gate
#[derive(Debug, Clone, Copy)]
struct LastMeasurement {
    angle_deg: f64,
    timestamp: f64,
}

/// Filter and bookkeeping for one tag
#[derive(Debug, Clone)]
struct TagTrack {
    kf: KalmanFilter,
    update_count: u32,
    last_update_time: f64,
    last_measurement: LastMeasurement,
    /// Confidence reduction left by the last speed cap, in [0, 1]
    speed_penalty: f64,
    history: VecDeque<TrackState>,
}

impl TagTrack {
    fn new(measurement: &PolarMeasurement, timestamp: f64, config: &TrackerConfig) -> Self {
        let (x, y) = measurement.to_local();
        let meas_var = config.measurement_noise_std * config.measurement_noise_std;

        let params = KalmanFilterParams {
            x: Vector4::new(x, y, 0.0, 0.0),
            p: Matrix4::from_diagonal(&Vector4::new(
                meas_var,
                meas_var,
                config.initial_velocity_variance,
                config.initial_velocity_variance,
            )),
            r: Matrix2::identity() * meas_var,
            q_accel: config.process_noise,
        };

        Self {
            kf: KalmanFilter::new(params),
            update_count: 1,
            last_update_time: timestamp,
            last_measurement: LastMeasurement {
                angle_deg: measurement.angle_deg(),
                timestamp,
            },
            speed_penalty: 0.0,
            history: VecDeque::with_capacity(config.history_len),
        }
    }

    /// Compare a new measurement against the last accepted one
    fn gate(
        &self,
        measurement: &PolarMeasurement,
        timestamp: f64,
        config: &TrackerConfig,
    ) -> Option<RejectReason> {
        let last = &self.last_measurement;
        let dt = timestamp - last.timestamp;
        if dt >= config.stale_reset_s || dt < 0.0 {
            return None;
        }

        let jump = angle_delta_deg(measurement.angle_deg(), last.angle_deg).abs();
        (jump > config.angle_jump_threshold_deg).then_some(RejectReason::AngleJump)
    }

    /// Predict to `timestamp` and correct. Returns whether the speed cap applied.
    fn step(
        &mut self,
        measurement: &PolarMeasurement,
        timestamp: f64,
        config: &TrackerConfig,
    ) -> anyhow::Result<bool> {
        let dt = (timestamp - self.last_update_time).clamp(0.0, config.max_dt);
        if dt > 0.0 {
            self.kf.predict(dt);
        }
        self.last_update_time = self.last_update_time.max(timestamp);
        self.last_measurement = LastMeasurement {
            angle_deg: measurement.angle_deg(),
            timestamp,
        };

        let (x, y) = measurement.to_local();
        self.kf.update(Vector2::new(x, y))?;
        self.update_count += 1;
        Ok(self.cap_speed(config.max_speed_mps))
    }

    /// Scale the filtered velocity down to `max_speed`; the overshoot becomes
    /// a confidence penalty that lasts until the next update
    fn cap_speed(&mut self, max_speed: f64) -> bool {
        let speed = self.kf.x[2].hypot(self.kf.x[3]);
        if speed <= max_speed {
            self.speed_penalty = 0.0;
            return false;
        }

        let scale = max_speed / speed;
        self.kf.x[2] *= scale;
        self.kf.x[3] *= scale;
        self.speed_penalty = ((speed / max_speed - 1.0) * 0.5).min(1.0);
        true
    }

    fn state(&self, tag_id: TagId, config: &TrackerConfig) -> TrackState {
        let x = self.kf.get_state();
        let trace = self.kf.position_trace();
        let confidence = 1.0 / (1.0 + trace / config.confidence_reference_variance)
            * (1.0 - self.speed_penalty);
        let initialized =
            self.update_count >= config.min_updates || trace <= config.init_trace_threshold;

        TrackState {
            tag_id,
            x: x[0],
            y: x[1],
            vx: x[2],
            vy: x[3],
            covariance: *self.kf.get_covariance(),
            confidence: confidence.clamp(0.0, 1.0),
            initialized,
            last_update_time: self.last_update_time,
            update_count: self.update_count,
            filtered: true,
        }
    }

    /// Append the current state to the bounded history
    fn record(&mut self, tag_id: TagId, config: &TrackerConfig) {
        if config.history_len == 0 {
            return;
        }
        while self.history.len() >= config.history_len {
            self.history.pop_front();
        }
        let snapshot = self.state(tag_id, config);
        self.history.push_back(snapshot);
    }
}

/// Multi-target tracker keyed by tag id
pub struct TargetTracker {
    config: TrackerConfig,
    tracks: Mutex<HashMap<TagId, Arc<Mutex<TagTrack>>>>,
    counters: AtomicCounters,
}

impl TargetTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Mutex::new(HashMap::new()),
            counters: AtomicCounters::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Feed one raw polar measurement for `tag_id` taken at `timestamp` seconds.
    ///
    /// Never fails: implausible input is dropped and counted.
    pub fn ingest(
        &self,
        tag_id: TagId,
        distance_mm: i32,
        angle_centidegrees: i16,
        timestamp: f64,
    ) -> IngestOutcome {
        if let Some(reason) = self.check(distance_mm, angle_centidegrees, timestamp) {
            return self.reject(tag_id, reason);
        }

        let measurement = PolarMeasurement::new(distance_mm, angle_centidegrees);

        let slot = {
            let mut tracks = self.tracks.lock();
            match tracks.entry(tag_id) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let mut track = TagTrack::new(&measurement, timestamp, &self.config);
                    track.record(tag_id, &self.config);
                    entry.insert(Arc::new(Mutex::new(track)));
                    drop(tracks);
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "Tracking new tag {} at {:.3} m / {:.2} deg",
                        tag_id,
                        measurement.distance_m(),
                        measurement.angle_deg()
                    );
                    return IngestOutcome::Created;
                }
            }
        };

        let mut track = slot.lock();
        if let Some(reason) = track.gate(&measurement, timestamp, &self.config) {
            drop(track);
            return self.reject(tag_id, reason);
        }

        match track.step(&measurement, timestamp, &self.config) {
            Ok(capped) => {
                track.record(tag_id, &self.config);
                drop(track);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                if capped {
                    self.counters.speed_capped.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Tag {} filtered speed capped at {:.1} m/s",
                        tag_id,
                        self.config.max_speed_mps
                    );
                }
                IngestOutcome::Updated
            }
            Err(e) => {
                drop(track);
                self.counters
                    .degenerate_updates
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!("Tag {} correction skipped: {}", tag_id, e);
                IngestOutcome::Degenerate
            }
        }
    }

    /// Range and timestamp checks shared by the filtered and raw paths
    fn check(
        &self,
        distance_mm: i32,
        angle_centidegrees: i16,
        timestamp: f64,
    ) -> Option<RejectReason> {
        if !timestamp.is_finite() {
            return Some(RejectReason::InvalidTimestamp);
        }
        if distance_mm <= 0
            || distance_mm > self.config.max_range_mm
            || (angle_centidegrees as i32).abs() > MAX_ANGLE_CENTIDEGREES
        {
            return Some(RejectReason::OutOfRange);
        }
        None
    }

    fn reject(&self, tag_id: TagId, reason: RejectReason) -> IngestOutcome {
        self.counters.reject(reason);
        log::debug!("Tag {} measurement rejected: {:?}", tag_id, reason);
        IngestOutcome::Rejected(reason)
    }

    /// Convert a raw reading without touching any filter, for running with
    /// filtering switched off. Range checks still apply and are counted.
    ///
    /// The result has zero velocity, the measurement noise as covariance and
    /// `filtered == false`.
    pub fn unfiltered(
        &self,
        tag_id: TagId,
        distance_mm: i32,
        angle_centidegrees: i16,
        timestamp: f64,
    ) -> Result<TrackState, RejectReason> {
        if let Some(reason) = self.check(distance_mm, angle_centidegrees, timestamp) {
            self.reject(tag_id, reason);
            return Err(reason);
        }

        let (x, y) = PolarMeasurement::new(distance_mm, angle_centidegrees).to_local();
        let meas_var = self.config.measurement_noise_std * self.config.measurement_noise_std;
        let confidence = 1.0 / (1.0 + 2.0 * meas_var / self.config.confidence_reference_variance);

        Ok(TrackState {
            tag_id,
            x,
            y,
            vx: 0.0,
            vy: 0.0,
            covariance: Matrix4::from_diagonal(&Vector4::new(meas_var, meas_var, 0.0, 0.0)),
            confidence: confidence.clamp(0.0, 1.0),
            initialized: true,
            last_update_time: timestamp,
            update_count: 1,
            filtered: false,
        })
    }

    /// Snapshot of `tag_id` recorded closest to `timestamp`, for aligning
    /// tracks with data stamped on the same clock. Ties go to the older
    /// snapshot.
    ///
    /// `None` if the tag is unknown or no history is kept.
    pub fn state_at(&self, tag_id: TagId, timestamp: f64) -> Option<TrackState> {
        let slot = self.tracks.lock().get(&tag_id).cloned()?;
        let track = slot.lock();
        let gap = |snapshot: &TrackState| (snapshot.last_update_time - timestamp).abs();
        track
            .history
            .iter()
            .min_by(|a, b| gap(a).total_cmp(&gap(b)))
            .cloned()
    }

    /// Current state of `tag_id`, or `None` if the tag was never seen
    pub fn get_state(&self, tag_id: TagId) -> Option<TrackState> {
        let slot = self.tracks.lock().get(&tag_id).cloned()?;
        let track = slot.lock();
        Some(track.state(tag_id, &self.config))
    }

    /// Ids of all tracked tags, ascending
    pub fn tag_ids(&self) -> Vec<TagId> {
        let mut ids: Vec<TagId> = self.tracks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// States of all tracked tags, ascending by id
    pub fn snapshot_all(&self) -> Vec<TrackState> {
        self.tag_ids()
            .into_iter()
            .filter_map(|tag_id| self.get_state(tag_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.lock().is_empty()
    }

    pub fn counters(&self) -> TrackerCounters {
        self.counters.snapshot()
    }

    /// Drop tracks whose last update is older than `timeout` seconds at `now`.
    ///
    /// Returns the evicted tag ids.
    pub fn remove_lost_targets(&self, now: f64, timeout: f64) -> Vec<TagId> {
        let slots: Vec<(TagId, Arc<Mutex<TagTrack>>)> = self
            .tracks
            .lock()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let lost: Vec<TagId> = slots
            .into_iter()
            .filter(|(_, slot)| now - slot.lock().last_update_time > timeout)
            .map(|(id, _)| id)
            .collect();

        if !lost.is_empty() {
            let mut tracks = self.tracks.lock();
            for tag_id in &lost {
                tracks.remove(tag_id);
                log::info!("Tag {} removed after {:.1}s without updates", tag_id, timeout);
            }
        }
        lost
    }

    /// Forget every track; counters are kept
    pub fn reset(&self) {
        self.tracks.lock().clear();
        log::info!("All tag tracks reset");
    }
}

impl Default for TargetTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::local_to_polar;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    /// Raw reading for a tag at local `(x, y)`
    fn reading(x: f64, y: f64) -> (i32, i16) {
        let (d, a) = local_to_polar(x, y);
        (
            (d * 1000.0).round() as i32,
            (a.to_degrees() * 100.0).round() as i16,
        )
    }

    #[test]
    fn test_unseen_tag_is_absent() {
        let tracker = TargetTracker::default();
        assert!(tracker.get_state(7).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_first_measurement_creates_uninitialized_track() {
        let tracker = TargetTracker::default();
        assert_eq!(tracker.ingest(1, 1500, -2500, 0.0), IngestOutcome::Created);

        let state = tracker.get_state(1).unwrap();
        assert!(!state.initialized);
        assert_eq!(state.update_count, 1);
        assert_abs_diff_eq!(state.x.hypot(state.y), 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(state.vx, 0.0);
        assert!(state.confidence > 0.0 && state.confidence <= 1.0);
    }

    #[test]
    fn test_initialized_after_min_updates() {
        let tracker = TargetTracker::default();
        let (d, a) = reading(0.0, 2.0);
        tracker.ingest(3, d, a, 0.0);
        tracker.ingest(3, d, a, 0.1);
        assert!(!tracker.get_state(3).unwrap().initialized);
        tracker.ingest(3, d, a, 0.2);
        assert!(tracker.get_state(3).unwrap().initialized);
    }

    #[test]
    fn test_constant_velocity_convergence() {
        let tracker = TargetTracker::default();
        let mut rng = StdRng::seed_from_u64(7);
        let distance_noise = Normal::<f64>::new(0.0, 10.0).unwrap(); // mm
        let angle_noise = Normal::<f64>::new(0.0, 20.0).unwrap(); // centidegrees

        let dt = 0.1;
        for step in 0..30 {
            let t = step as f64 * dt;
            let (x, y) = (-1.0 + 0.5 * t, 2.0);
            let (d, a) = local_to_polar(x, y);
            let noisy_d = d * 1000.0 + distance_noise.sample(&mut rng).clamp(-20.0, 20.0);
            let noisy_a = a.to_degrees() * 100.0 + angle_noise.sample(&mut rng).clamp(-40.0, 40.0);
            let outcome = tracker.ingest(1, noisy_d.round() as i32, noisy_a.round() as i16, t);
            assert!(!matches!(outcome, IngestOutcome::Rejected(_)));
        }

        let state = tracker.get_state(1).unwrap();
        assert!(state.initialized);
        assert!(
            (state.vx - 0.5).abs() < 0.05,
            "vx = {} should be within 10% of 0.5",
            state.vx
        );
        assert!(state.vy.abs() < 0.05);
        assert!(state.confidence > 0.5, "confidence = {}", state.confidence);
    }

    #[test]
    fn test_out_of_range_measurements_are_counted() {
        let tracker = TargetTracker::default();
        assert_eq!(
            tracker.ingest(1, 0, 0, 0.0),
            IngestOutcome::Rejected(RejectReason::OutOfRange)
        );
        assert_eq!(
            tracker.ingest(1, -20, 0, 0.0),
            IngestOutcome::Rejected(RejectReason::OutOfRange)
        );
        assert_eq!(
            tracker.ingest(1, 200_000, 0, 0.0),
            IngestOutcome::Rejected(RejectReason::OutOfRange)
        );
        assert_eq!(
            tracker.ingest(1, 1000, 18_001, 0.0),
            IngestOutcome::Rejected(RejectReason::OutOfRange)
        );
        assert_eq!(
            tracker.ingest(1, 1000, 0, f64::NAN),
            IngestOutcome::Rejected(RejectReason::InvalidTimestamp)
        );

        // Rejections never create a track
        assert!(tracker.get_state(1).is_none());
        let counters = tracker.counters();
        assert_eq!(counters.rejected_out_of_range, 4);
        assert_eq!(counters.rejected_invalid_timestamp, 1);
        assert_eq!(counters.rejected(), 5);
        assert_eq!(counters.accepted, 0);
    }

    #[test]
    fn test_angle_jump_is_rejected_until_stale() {
        let tracker = TargetTracker::default();
        tracker.ingest(2, 2000, 0, 0.0);
        assert_eq!(
            tracker.ingest(2, 2000, 12_000, 0.1),
            IngestOutcome::Rejected(RejectReason::AngleJump)
        );

        // Once the last accepted reading is older than stale_reset_s the gate reopens
        assert_eq!(tracker.ingest(2, 2000, 12_000, 1.0), IngestOutcome::Updated);
        assert_eq!(tracker.counters().rejected_angle_jump, 1);
    }

    #[test]
    fn test_noisy_stationary_tag_at_50hz_is_not_rejected() {
        let tracker = TargetTracker::default();
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::<f64>::new(0.0, 0.1).unwrap(); // m, same as measurement_noise_std

        let n = 500;
        for step in 0..n {
            let t = step as f64 * 0.02;
            let (d, a) = reading(noise.sample(&mut rng), 3.0 + noise.sample(&mut rng));
            tracker.ingest(1, d, a, t);
        }

        let counters = tracker.counters();
        assert_eq!(counters.rejected(), 0);
        assert_eq!(counters.accepted, n);

        let state = tracker.get_state(1).unwrap();
        assert!(state.x.abs() < 0.15, "x = {}", state.x);
        assert!((state.y - 3.0).abs() < 0.15, "y = {}", state.y);
        assert!(state.speed() < 1.0, "speed = {}", state.speed());
    }

    #[test]
    fn test_filtered_speed_is_capped() {
        let capped = TargetTracker::default();
        let free = TargetTracker::new(TrackerConfig {
            max_speed_mps: 100.0,
            ..TrackerConfig::default()
        });
        for tracker in [&capped, &free] {
            tracker.ingest(4, 1000, 0, 0.0);
            // 3 m in 0.1 s is still applied
            assert_eq!(tracker.ingest(4, 4000, 0, 0.1), IngestOutcome::Updated);
        }

        let fast = free.get_state(4).unwrap();
        let slow = capped.get_state(4).unwrap();
        assert!(fast.speed() > 5.0);
        assert_abs_diff_eq!(slow.speed(), 5.0, epsilon = 1e-9);
        assert!(slow.confidence < fast.confidence);
        assert_eq!(capped.counters().speed_capped, 1);
        assert_eq!(capped.counters().rejected(), 0);
        assert_eq!(free.counters().speed_capped, 0);
    }

    #[test]
    fn test_state_at_picks_nearest_snapshot() {
        let tracker = TargetTracker::default();
        assert!(tracker.state_at(1, 0.0).is_none());

        tracker.ingest(1, 2000, 0, 1.0);
        tracker.ingest(1, 2010, 0, 2.0);
        tracker.ingest(1, 2020, 0, 3.0);

        assert_eq!(tracker.state_at(1, 2.2).unwrap().update_count, 2);
        assert_eq!(tracker.state_at(1, 10.0).unwrap().update_count, 3);
        assert_eq!(tracker.state_at(1, -5.0).unwrap().update_count, 1);
        // Halfway between two snapshots the older one wins
        assert_eq!(tracker.state_at(1, 1.5).unwrap().update_count, 1);
        assert_abs_diff_eq!(tracker.state_at(1, 1.5).unwrap().last_update_time, 1.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = TargetTracker::new(TrackerConfig {
            history_len: 3,
            ..TrackerConfig::default()
        });
        for step in 0..10 {
            tracker.ingest(1, 2000, 0, step as f64 * 0.1);
        }
        // Only updates 8, 9 and 10 are kept
        assert_eq!(tracker.state_at(1, 0.0).unwrap().update_count, 8);

        let no_history = TargetTracker::new(TrackerConfig {
            history_len: 0,
            ..TrackerConfig::default()
        });
        no_history.ingest(1, 2000, 0, 0.0);
        assert!(no_history.get_state(1).is_some());
        assert!(no_history.state_at(1, 0.0).is_none());
    }

    #[test]
    fn test_unfiltered_reading_leaves_tracks_alone() {
        let tracker = TargetTracker::default();
        let state = tracker.unfiltered(6, 2000, 9000, 4.0).unwrap();
        assert!(!state.filtered);
        assert_abs_diff_eq!(state.x, -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.y, 0.0, epsilon = 1e-9);
        assert_eq!(state.velocity(), (0.0, 0.0));
        assert_abs_diff_eq!(state.last_update_time, 4.0);
        assert!(tracker.get_state(6).is_none());

        assert_eq!(tracker.unfiltered(6, 0, 0, 4.0), Err(RejectReason::OutOfRange));
        assert_eq!(tracker.counters().rejected_out_of_range, 1);
    }

    #[test]
    fn test_long_gap_is_clamped() {
        let a = TargetTracker::default();
        let b = TargetTracker::default();
        for tracker in [&a, &b] {
            tracker.ingest(1, 2000, 0, 0.0);
            tracker.ingest(1, 2010, 0, 0.1);
        }
        a.ingest(1, 2020, 0, 1.1);
        b.ingest(1, 2020, 0, 100.1);

        let sa = a.get_state(1).unwrap();
        let sb = b.get_state(1).unwrap();
        assert_abs_diff_eq!(sa.covariance, sb.covariance, epsilon = 1e-12);
        assert_abs_diff_eq!(sa.y, sb.y, epsilon = 1e-12);
        assert!(sb.covariance[(0, 0)].is_finite());
    }

    #[test]
    fn test_out_of_order_timestamp_does_not_predict() {
        let tracker = TargetTracker::default();
        tracker.ingest(1, 2000, 0, 1.0);
        assert_eq!(tracker.ingest(1, 2000, 0, 0.5), IngestOutcome::Updated);
        let state = tracker.get_state(1).unwrap();
        assert_abs_diff_eq!(state.last_update_time, 1.0);
    }

    #[test]
    fn test_tags_are_independent() {
        let tracker = TargetTracker::default();
        tracker.ingest(1, 1000, 0, 0.0);
        tracker.ingest(2, 3000, 4500, 0.0);
        assert_eq!(tracker.tag_ids(), vec![1, 2]);

        let s1 = tracker.get_state(1).unwrap();
        let s2 = tracker.get_state(2).unwrap();
        assert_abs_diff_eq!(s1.y, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s2.x.hypot(s2.y), 3.0, epsilon = 1e-9);
        assert_eq!(tracker.snapshot_all().len(), 2);
    }

    #[test]
    fn test_remove_lost_targets() {
        let tracker = TargetTracker::default();
        tracker.ingest(1, 1000, 0, 0.0);
        tracker.ingest(2, 1000, 0, 5.0);

        let lost = tracker.remove_lost_targets(6.0, 2.0);
        assert_eq!(lost, vec![1]);
        assert!(tracker.get_state(1).is_none());
        assert!(tracker.get_state(2).is_some());

        tracker.reset();
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_extrapolate() {
        let state = TrackState {
            tag_id: 1,
            x: 1.0,
            y: 2.0,
            vx: 0.5,
            vy: -1.0,
            covariance: Matrix4::identity(),
            confidence: 0.9,
            initialized: true,
            last_update_time: 0.0,
            update_count: 10,
            filtered: true,
        };
        let (x, y) = state.extrapolate(0.5);
        assert_abs_diff_eq!(x, 1.25);
        assert_abs_diff_eq!(y, 1.5);
        assert_abs_diff_eq!(state.speed(), 1.25f64.sqrt());
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            measurement_noise_std: 0.0,
            ..TrackerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
