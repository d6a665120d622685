//! Type definitions shared by the pipeline stages

use crate::pose::PosePollSnapshot;
use crate::protocol::Frame;
use aoatrack::{GlobalPosition, TagId, TrackState, TrackerCounters};
use serde::{Deserialize, Serialize};

/// Everything the pipeline publishes to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum PipelineEvent {
    /// Raw frame that passed its checksum
    Frame(Frame),
    /// Filtered state after a tracker update
    Track(TrackState),
    /// Track projected into the map frame with a fresh pose
    Global(GlobalPosition),
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::Frame(_) => EventKind::Frame,
            PipelineEvent::Track(_) => EventKind::Track,
            PipelineEvent::Global(_) => EventKind::Global,
        }
    }

    /// Tag the event is about; used to route a tag to one delivery worker
    pub fn tag_id(&self) -> TagId {
        match self {
            PipelineEvent::Frame(frame) => frame.tag_id,
            PipelineEvent::Track(track) => track.tag_id,
            PipelineEvent::Global(global) => global.tag_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Frame,
    Track,
    Global,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Frame, EventKind::Track, EventKind::Global];

    fn bit(self) -> u8 {
        match self {
            EventKind::Frame => 0b001,
            EventKind::Track => 0b010,
            EventKind::Global => 0b100,
        }
    }
}

/// Set of event kinds a subscriber wants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    pub fn all() -> Self {
        Self::from_kinds(&EventKind::ALL)
    }

    pub fn from_kinds(kinds: &[EventKind]) -> Self {
        Self(kinds.iter().fold(0, |mask, kind| mask | kind.bit()))
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: EventMask) -> Self {
        Self(self.0 | other.0)
    }
}

impl From<&[EventKind]> for EventMask {
    fn from(kinds: &[EventKind]) -> Self {
        Self::from_kinds(kinds)
    }
}

/// Counters of the delivery worker pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryCounters {
    /// Events handed to a worker queue
    pub events_dispatched: u64,
    /// Events dropped because the worker queue was full
    pub events_dropped: u64,
    /// Deliveries that reached a subscriber
    pub deliveries: u64,
    /// Events lost because a channel subscriber's queue was full
    pub subscriber_overflows: u64,
    pub subscriber_panics: u64,
    /// Queued events thrown away by a forced shutdown
    pub events_discarded: u64,
}

/// Point-in-time view of the pipeline, cheap enough to poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    /// Whether readings currently go through the Kalman filters
    pub filter_enabled: bool,
    pub frames_ok: u64,
    pub frames_error: u64,
    pub bytes_consumed: u64,
    pub active_tag_ids: Vec<TagId>,
    /// Seconds since the last pose sample, if any arrived
    pub last_pose_age: Option<f64>,
    pub transport_connected: bool,
    pub last_transport_error: Option<String>,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub subscriber_overflows: u64,
    pub subscriber_panics: u64,
    pub globals_published: u64,
    /// Tracker updates that produced no global position for lack of a fresh pose
    pub globals_skipped: u64,
    pub rejected_measurements: u64,
    pub tracker: TrackerCounters,
    pub pose_polls: PosePollSnapshot,
}

/// What `stop()` had to do to get the pipeline down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// False when the acquisition thread was still inside a read at the deadline
    pub acquisition_joined: bool,
    /// Delivery workers left running inside a subscriber
    pub workers_detached: usize,
    pub events_discarded: u64,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask() {
        let mask = EventMask::from_kinds(&[EventKind::Track, EventKind::Global]);
        assert!(!mask.contains(EventKind::Frame));
        assert!(mask.contains(EventKind::Track));
        assert!(mask.contains(EventKind::Global));
        assert!(EventMask::default().is_empty());

        let all = mask.union(EventMask::from_kinds(&[EventKind::Frame]));
        assert_eq!(all, EventMask::all());
    }

    #[test]
    fn test_event_routing_key() {
        let event = PipelineEvent::Frame(Frame::measurement(1, 9, 1000, 0));
        assert_eq!(event.kind(), EventKind::Frame);
        assert_eq!(event.tag_id(), 9);
    }

    #[test]
    fn test_event_serializes_with_kind() {
        let event = PipelineEvent::Frame(Frame::measurement(1, 2, 1500, -2500));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "Frame");
        assert_eq!(json["data"]["distance_mm"], 1500);
    }
}
