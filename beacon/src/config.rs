//! Pipeline configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```json
//! {
//!   "tracker": { "process_noise": 0.3 },
//!   "pipeline": { "delivery_workers": 4, "lost_target_timeout_s": 5.0 }
//! }
//! ```

use crate::error::{BeaconError, Result};
use crate::transport::ReconnectPolicy;
use aoatrack::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Threading and timing of the delivery pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound of one blocking transport read (ms); also bounds how long
    /// the acquisition thread takes to notice a stop request
    pub read_timeout_ms: u64,
    /// Number of delivery worker threads
    pub delivery_workers: usize,
    /// Pending events per delivery worker before new events are dropped
    pub delivery_queue_capacity: usize,
    /// Pose poll period (ms)
    pub pose_poll_interval_ms: u64,
    /// Upper bound of one pose query (ms)
    pub pose_query_timeout_ms: u64,
    /// A cached pose older than this is not used for projection (ms)
    pub pose_max_age_ms: u64,
    /// Speed below which the heading of a global position is unreliable (m/s)
    pub min_heading_speed: f64,
    /// Budget for `stop()` (ms)
    pub shutdown_timeout_ms: u64,
    /// Evict tags silent for this long (s); `None` keeps tracks forever
    pub lost_target_timeout_s: Option<f64>,
    /// Emit a stats line every this many frames; 0 disables it
    pub stats_log_every: u64,
    /// Run readings through the Kalman filters. When off, raw readings are
    /// converted and published as they arrive.
    pub filter_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 50,
            delivery_workers: 2,
            delivery_queue_capacity: 256,
            pose_poll_interval_ms: 100,
            pose_query_timeout_ms: 80,
            pose_max_age_ms: 300,
            min_heading_speed: 0.1,
            shutdown_timeout_ms: 1_000,
            lost_target_timeout_s: None,
            stats_log_every: 1_000,
            filter_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn pose_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pose_poll_interval_ms)
    }

    pub fn pose_query_timeout(&self) -> Duration {
        Duration::from_millis(self.pose_query_timeout_ms)
    }

    pub fn pose_max_age(&self) -> Duration {
        Duration::from_millis(self.pose_max_age_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(BeaconError::config("read_timeout_ms must be positive"));
        }
        if self.delivery_workers == 0 {
            return Err(BeaconError::config("delivery_workers must be at least 1"));
        }
        if self.delivery_queue_capacity == 0 {
            return Err(BeaconError::config("delivery_queue_capacity must be at least 1"));
        }
        if self.pose_poll_interval_ms == 0 || self.pose_query_timeout_ms == 0 {
            return Err(BeaconError::config(
                "pose_poll_interval_ms and pose_query_timeout_ms must be positive",
            ));
        }
        if !(self.min_heading_speed.is_finite() && self.min_heading_speed >= 0.0) {
            return Err(BeaconError::config(format!(
                "min_heading_speed must be non-negative, got {}",
                self.min_heading_speed
            )));
        }
        if let Some(timeout) = self.lost_target_timeout_s {
            if !(timeout.is_finite() && timeout > 0.0) {
                return Err(BeaconError::config(format!(
                    "lost_target_timeout_s must be positive, got {}",
                    timeout
                )));
            }
        }
        Ok(())
    }
}

/// Top-level configuration of a beacon pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub tracker: TrackerConfig,
    pub pipeline: PipelineConfig,
    pub reconnect: ReconnectPolicy,
}

impl BeaconConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&content)?;
        log::info!("Loaded beacon config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate().map_err(BeaconError::config)?;
        self.pipeline.validate()?;
        if self.reconnect.multiplier < 1.0 {
            return Err(BeaconError::config("reconnect.multiplier must be >= 1.0"));
        }
        Ok(())
    }
}
