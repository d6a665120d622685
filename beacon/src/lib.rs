//! AoA beacon pipeline library
//!
//! Decodes the anchor's 33-byte measurement frames from a raw byte stream,
//! tracks every tag with [`aoatrack`], projects the tracks into the map frame
//! through the carrier pose and fans the results out to subscribers without
//! letting a slow subscriber stall acquisition.
//!
//! ```rust,ignore
//! use aoa_beacon::{BeaconConfig, BeaconPipeline, ChannelSource, EventKind, PipelineEvent};
//!
//! let (bytes_tx, source) = ChannelSource::pair(1024);
//! let pipeline = BeaconPipeline::start(BeaconConfig::default(), Some(Box::new(source)), None)?;
//!
//! pipeline.subscribe_fn(&[EventKind::Global], |event| {
//!     if let PipelineEvent::Global(global) = event {
//!         println!("tag {} at ({:.2}, {:.2})", global.tag_id, global.x, global.y);
//!     }
//! });
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod pose;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_util;

pub use config::{BeaconConfig, PipelineConfig};
pub use delivery::{DeliveryPool, Dispatcher, SubscriberId, SubscriberRegistry};
pub use error::{BeaconError, PoseError, Result, TransportError};
pub use pipeline::BeaconPipeline;
pub use pose::{PoseCache, PoseSource};
pub use protocol::{ExtractorCounters, Frame, FrameExtractor, FRAME_HEADER, FRAME_LEN};
pub use transport::{
    connect_with_backoff, tcp_source, ByteSource, ChannelSource, ReaderSource, ReconnectPolicy,
};
pub use types::{EventKind, EventMask, PipelineEvent, PipelineStatus, ShutdownReport};

pub use aoatrack::{GlobalPosition, Pose, TrackState, TrackerConfig};

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
